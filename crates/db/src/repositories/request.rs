use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use keystone_core::approvals::{
    ApprovalRequestStore, OverdueCursor, PortError, TypeStatusCount,
};
use keystone_core::domain::policy::{ApprovalType, PolicyId, MAX_ESCALATION_LEVEL};
use keystone_core::domain::request::{
    ApprovalRequest, ApprovalRequestId, ApprovalStatus, Priority,
};
use keystone_core::domain::task::TaskId;

use super::{
    decode_json, encode_json, format_timestamp, is_unique_violation, parse_optional_timestamp,
    parse_timestamp, parse_u32, parse_u8, RepositoryError,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, org_id, project_id, approval_type, policy_id, entity_type,
    entity_id, requested_by, request_data_json, priority, title, description, status,
    approver_actions_json, current_approval_count, required_approvals, sla_deadline,
    current_escalation_level, escalation_history_json, audit_trail_json, task_id, resolved_by,
    resolved_at, resolution_comment, version, created_at, updated_at";

/// Approval requests with JSON columns for the nested action, escalation and audit lists.
///
/// Every update is conditional on the caller's `expected_version`.
pub struct SqlApprovalRequestStore {
    pool: DbPool,
}

impl SqlApprovalRequestStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(
        &self,
        clause: &str,
        binds: &[&str],
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM approval_request {clause} LIMIT ?");
        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.bind(i64::from(limit)).fetch_all(&self.pool).await?;

        rows.into_iter().map(request_from_row).collect()
    }

    async fn exists(&self, id: &ApprovalRequestId) -> Result<bool, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM approval_request WHERE id = ?")
            .bind(&id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

#[async_trait]
impl ApprovalRequestStore for SqlApprovalRequestStore {
    async fn insert(&self, request: ApprovalRequest) -> Result<(), PortError> {
        let result = sqlx::query(&format!(
            "INSERT INTO approval_request ({REQUEST_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&request.id.0)
        .bind(&request.org_id)
        .bind(request.project_id.as_deref())
        .bind(request.approval_type.as_str())
        .bind(&request.policy_id.0)
        .bind(&request.entity_type)
        .bind(&request.entity_id)
        .bind(&request.requested_by)
        .bind(encode_json("request_data_json", &request.request_data)?)
        .bind(request.priority.as_str())
        .bind(&request.title)
        .bind(request.description.as_deref())
        .bind(request.status.as_str())
        .bind(encode_json("approver_actions_json", &request.approver_actions)?)
        .bind(i64::from(request.current_approval_count))
        .bind(i64::from(request.required_approvals))
        .bind(format_timestamp(request.sla_deadline))
        .bind(i64::from(request.current_escalation_level))
        .bind(encode_json("escalation_history_json", &request.escalation_history)?)
        .bind(encode_json("audit_trail_json", &request.audit_trail)?)
        .bind(request.task_id.as_ref().map(|task| task.0.as_str()))
        .bind(request.resolved_by.as_deref())
        .bind(request.resolved_at.map(format_timestamp))
        .bind(request.resolution_comment.as_deref())
        .bind(i64::from(request.version))
        .bind(format_timestamp(request.created_at))
        .bind(format_timestamp(request.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => {
                Err(PortError::Duplicate(format!("approval request `{}`", request.id.0)))
            }
            Err(error) => Err(RepositoryError::from(error).into()),
        }
    }

    async fn find_by_id(
        &self,
        id: &ApprovalRequestId,
    ) -> Result<Option<ApprovalRequest>, PortError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(request_from_row).transpose()?)
    }

    async fn update(
        &self,
        mut request: ApprovalRequest,
        expected_version: u32,
    ) -> Result<ApprovalRequest, PortError> {
        let next_version = expected_version + 1;
        let result = sqlx::query(
            "UPDATE approval_request SET
                status = ?,
                approver_actions_json = ?,
                current_approval_count = ?,
                current_escalation_level = ?,
                escalation_history_json = ?,
                audit_trail_json = ?,
                task_id = ?,
                resolved_by = ?,
                resolved_at = ?,
                resolution_comment = ?,
                version = ?,
                updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(request.status.as_str())
        .bind(encode_json("approver_actions_json", &request.approver_actions)?)
        .bind(i64::from(request.current_approval_count))
        .bind(i64::from(request.current_escalation_level))
        .bind(encode_json("escalation_history_json", &request.escalation_history)?)
        .bind(encode_json("audit_trail_json", &request.audit_trail)?)
        .bind(request.task_id.as_ref().map(|task| task.0.as_str()))
        .bind(request.resolved_by.as_deref())
        .bind(request.resolved_at.map(format_timestamp))
        .bind(request.resolution_comment.as_deref())
        .bind(i64::from(next_version))
        .bind(format_timestamp(request.updated_at))
        .bind(&request.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            if self.exists(&request.id).await? {
                return Err(PortError::VersionConflict {
                    request_id: request.id.0.clone(),
                    expected_version,
                });
            }
            return Err(PortError::Missing(format!("approval request `{}`", request.id.0)));
        }

        request.version = next_version;
        Ok(request)
    }

    async fn list_overdue(
        &self,
        now: DateTime<Utc>,
        after: Option<&OverdueCursor>,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        let now = format_timestamp(now);
        let base = format!(
            "WHERE status = 'pending' AND sla_deadline < ? \
             AND current_escalation_level < {MAX_ESCALATION_LEVEL}"
        );
        let order = "ORDER BY sla_deadline ASC, id ASC";

        let rows = match after {
            None => self.fetch_where(&format!("{base} {order}"), &[now.as_str()], limit).await?,
            Some(cursor) => {
                let deadline = format_timestamp(cursor.sla_deadline);
                self.fetch_where(
                    &format!(
                        "{base} AND (sla_deadline > ? OR (sla_deadline = ? AND id > ?)) {order}"
                    ),
                    &[now.as_str(), deadline.as_str(), deadline.as_str(), cursor.id.0.as_str()],
                    limit,
                )
                .await?
            }
        };
        Ok(rows)
    }

    async fn list_pending_for_approver(
        &self,
        org_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        Ok(self
            .fetch_where(
                "WHERE org_id = ? AND status = 'pending'
                   AND EXISTS (
                       SELECT 1 FROM json_each(approval_request.approver_actions_json) AS entry
                       WHERE json_extract(entry.value, '$.user_id') = ?
                         AND json_extract(entry.value, '$.action') = 'pending'
                   )
                 ORDER BY created_at DESC",
                &[org_id, user_id],
                limit,
            )
            .await?)
    }

    async fn list_by_requester(
        &self,
        org_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        Ok(self
            .fetch_where(
                "WHERE org_id = ? AND requested_by = ? ORDER BY created_at DESC",
                &[org_id, user_id],
                limit,
            )
            .await?)
    }

    async fn list_recently_resolved(
        &self,
        org_id: &str,
        limit: u32,
    ) -> Result<Vec<ApprovalRequest>, PortError> {
        Ok(self
            .fetch_where(
                "WHERE org_id = ? AND status IN ('approved', 'rejected', 'cancelled')
                 ORDER BY COALESCE(resolved_at, updated_at) DESC",
                &[org_id],
                limit,
            )
            .await?)
    }

    async fn count_by_type_and_status(
        &self,
        org_id: &str,
    ) -> Result<Vec<TypeStatusCount>, PortError> {
        let rows = sqlx::query(
            "SELECT approval_type, status, COUNT(*) AS count
             FROM approval_request
             WHERE org_id = ?
             GROUP BY approval_type, status
             ORDER BY approval_type, status",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let counts = rows
            .into_iter()
            .map(|row| -> Result<TypeStatusCount, RepositoryError> {
                let count = row.try_get::<i64, _>("count")?;
                Ok(TypeStatusCount {
                    approval_type: parse_type(row.try_get("approval_type")?)?,
                    status: parse_status(row.try_get("status")?)?,
                    count: u64::try_from(count).map_err(|_| {
                        RepositoryError::Decode(format!("negative count {count}"))
                    })?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

fn parse_type(raw: String) -> Result<ApprovalType, RepositoryError> {
    ApprovalType::parse(&raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval type `{raw}`")))
}

fn parse_status(raw: String) -> Result<ApprovalStatus, RepositoryError> {
    ApprovalStatus::parse(&raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{raw}`")))
}

fn request_from_row(row: SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let priority_raw = row.try_get::<String, _>("priority")?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority_raw}`")))?;

    Ok(ApprovalRequest {
        id: ApprovalRequestId(row.try_get("id")?),
        org_id: row.try_get("org_id")?,
        project_id: row.try_get("project_id")?,
        approval_type: parse_type(row.try_get("approval_type")?)?,
        policy_id: PolicyId(row.try_get("policy_id")?),
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        requested_by: row.try_get("requested_by")?,
        request_data: decode_json(
            "request_data_json",
            &row.try_get::<String, _>("request_data_json")?,
        )?,
        priority,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: parse_status(row.try_get("status")?)?,
        approver_actions: decode_json(
            "approver_actions_json",
            &row.try_get::<String, _>("approver_actions_json")?,
        )?,
        current_approval_count: parse_u32(
            "current_approval_count",
            row.try_get("current_approval_count")?,
        )?,
        required_approvals: parse_u32("required_approvals", row.try_get("required_approvals")?)?,
        sla_deadline: parse_timestamp("sla_deadline", row.try_get("sla_deadline")?)?,
        current_escalation_level: parse_u8(
            "current_escalation_level",
            row.try_get("current_escalation_level")?,
        )?,
        escalation_history: decode_json(
            "escalation_history_json",
            &row.try_get::<String, _>("escalation_history_json")?,
        )?,
        audit_trail: decode_json(
            "audit_trail_json",
            &row.try_get::<String, _>("audit_trail_json")?,
        )?,
        task_id: row.try_get::<Option<String>, _>("task_id")?.map(TaskId),
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: parse_optional_timestamp("resolved_at", row.try_get("resolved_at")?)?,
        resolution_comment: row.try_get("resolution_comment")?,
        version: parse_u32("version", row.try_get("version")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
