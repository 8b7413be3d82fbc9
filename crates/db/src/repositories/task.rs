use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

use keystone_core::approvals::{PortError, TaskTracker};
use keystone_core::domain::request::{ApprovalRequestId, ApprovalStatus, Priority};
use keystone_core::domain::task::{NewTask, TaskEscalation, TaskId, TaskResolution, TrackedTask};

use super::{
    decode_json, encode_json, format_timestamp, parse_timestamp, parse_u8, RepositoryError,
};
use crate::DbPool;

/// One row of the approval task board.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskBoardEntry {
    pub id: TaskId,
    pub org_id: String,
    pub approval_request_id: ApprovalRequestId,
    pub title: String,
    pub assignee: String,
    pub watchers: Vec<String>,
    pub due_at: DateTime<Utc>,
    pub priority: Priority,
    pub done: bool,
    pub outcome: Option<ApprovalStatus>,
    pub resolved_by: Option<String>,
    pub escalation_level: u8,
    pub last_escalation_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub struct SqlTaskTracker {
    pool: DbPool,
}

impl SqlTaskTracker {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find(&self, id: &TaskId) -> Result<Option<TaskBoardEntry>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, org_id, approval_request_id, title, assignee, watchers_json, due_at,
                    priority, status, outcome, resolved_by, escalation_level,
                    last_escalation_reason, updated_at
             FROM approval_task WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(entry_from_row).transpose()
    }

    /// Open tasks assigned to `assignee`, soonest due first.
    pub async fn open_for_assignee(
        &self,
        org_id: &str,
        assignee: &str,
    ) -> Result<Vec<TaskBoardEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, org_id, approval_request_id, title, assignee, watchers_json, due_at,
                    priority, status, outcome, resolved_by, escalation_level,
                    last_escalation_reason, updated_at
             FROM approval_task
             WHERE org_id = ? AND assignee = ? AND status = 'open'
             ORDER BY due_at ASC",
        )
        .bind(org_id)
        .bind(assignee)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl TaskTracker for SqlTaskTracker {
    async fn create_task(&self, task: &NewTask) -> Result<TrackedTask, PortError> {
        let id = TaskId(format!("TASK-{}", Uuid::new_v4()));
        let now = format_timestamp(Utc::now());
        sqlx::query(
            "INSERT INTO approval_task (
                id, org_id, approval_request_id, title, description, assignee, watchers_json,
                due_at, priority, status, created_by, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'open', ?, ?, ?)",
        )
        .bind(&id.0)
        .bind(&task.org_id)
        .bind(&task.approval_request_id.0)
        .bind(&task.title)
        .bind(task.description.as_deref())
        .bind(&task.assignee)
        .bind(encode_json("watchers_json", &task.watchers)?)
        .bind(format_timestamp(task.due_at))
        .bind(task.priority.as_str())
        .bind(&task.created_by)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(TrackedTask { id, assignee: task.assignee.clone(), priority: task.priority })
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        resolution: &TaskResolution,
    ) -> Result<(), PortError> {
        let result = sqlx::query(
            "UPDATE approval_task SET
                status = 'done',
                outcome = ?,
                resolved_by = ?,
                resolution_comment = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(resolution.outcome.as_str())
        .bind(&resolution.resolved_by)
        .bind(resolution.comment.as_deref())
        .bind(format_timestamp(Utc::now()))
        .bind(&task_id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(PortError::Missing(format!("task `{}`", task_id.0)));
        }
        Ok(())
    }

    async fn escalate_task(
        &self,
        task_id: &TaskId,
        escalation: &TaskEscalation,
    ) -> Result<(), PortError> {
        let result = sqlx::query(
            "UPDATE approval_task SET
                assignee = ?,
                priority = ?,
                escalation_level = ?,
                last_escalation_reason = ?,
                updated_at = ?
             WHERE id = ? AND status = 'open'",
        )
        .bind(&escalation.new_assignee)
        .bind(escalation.priority.as_str())
        .bind(i64::from(escalation.level))
        .bind(&escalation.reason)
        .bind(format_timestamp(Utc::now()))
        .bind(&task_id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(PortError::Missing(format!("open task `{}`", task_id.0)));
        }
        Ok(())
    }
}

fn entry_from_row(row: SqliteRow) -> Result<TaskBoardEntry, RepositoryError> {
    let priority_raw = row.try_get::<String, _>("priority")?;
    let priority = Priority::parse(&priority_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown priority `{priority_raw}`")))?;
    let outcome = row
        .try_get::<Option<String>, _>("outcome")?
        .map(|raw| {
            ApprovalStatus::parse(&raw)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown task outcome `{raw}`")))
        })
        .transpose()?;

    Ok(TaskBoardEntry {
        id: TaskId(row.try_get("id")?),
        org_id: row.try_get("org_id")?,
        approval_request_id: ApprovalRequestId(row.try_get("approval_request_id")?),
        title: row.try_get("title")?,
        assignee: row.try_get("assignee")?,
        watchers: decode_json("watchers_json", &row.try_get::<String, _>("watchers_json")?)?,
        due_at: parse_timestamp("due_at", row.try_get("due_at")?)?,
        priority,
        done: row.try_get::<String, _>("status")? == "done",
        outcome,
        resolved_by: row.try_get("resolved_by")?,
        escalation_level: parse_u8("escalation_level", row.try_get("escalation_level")?)?,
        last_escalation_reason: row.try_get("last_escalation_reason")?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use keystone_core::approvals::{PortError, TaskTracker};
    use keystone_core::domain::request::{ApprovalRequestId, ApprovalStatus, Priority};
    use keystone_core::domain::task::{NewTask, TaskEscalation, TaskId, TaskResolution};

    use super::SqlTaskTracker;
    use crate::repositories::test_support::setup_pool;

    fn new_task() -> NewTask {
        NewTask {
            org_id: "org-1".to_string(),
            approval_request_id: ApprovalRequestId("APR-1".to_string()),
            title: "Approve 6% discount on unit 12".to_string(),
            description: None,
            assignee: "u-sm".to_string(),
            watchers: vec!["u-gm".to_string()],
            due_at: Utc::now() + Duration::hours(24),
            priority: Priority::Medium,
            created_by: "u-agent".to_string(),
        }
    }

    #[tokio::test]
    async fn task_lifecycle_create_escalate_complete() {
        let tracker = SqlTaskTracker::new(setup_pool().await);
        let tracked = tracker.create_task(&new_task()).await.expect("create");
        assert!(tracked.id.0.starts_with("TASK-"));

        let open = tracker.open_for_assignee("org-1", "u-sm").await.expect("open");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].watchers, vec!["u-gm".to_string()]);

        tracker
            .escalate_task(
                &tracked.id,
                &TaskEscalation {
                    new_assignee: "u-md".to_string(),
                    level: 1,
                    priority: Priority::Urgent,
                    reason: "SLA breached".to_string(),
                },
            )
            .await
            .expect("escalate");
        let escalated = tracker.find(&tracked.id).await.expect("find").expect("task");
        assert_eq!(escalated.assignee, "u-md");
        assert_eq!(escalated.priority, Priority::Urgent);
        assert_eq!(escalated.escalation_level, 1);

        tracker
            .complete_task(
                &tracked.id,
                &TaskResolution {
                    outcome: ApprovalStatus::Approved,
                    resolved_by: "u-md".to_string(),
                    comment: Some("fine".to_string()),
                },
            )
            .await
            .expect("complete");
        let done = tracker.find(&tracked.id).await.expect("find").expect("task");
        assert!(done.done);
        assert_eq!(done.outcome, Some(ApprovalStatus::Approved));
        assert!(tracker.open_for_assignee("org-1", "u-md").await.expect("open").is_empty());
    }

    #[tokio::test]
    async fn unknown_tasks_are_missing() {
        let tracker = SqlTaskTracker::new(setup_pool().await);
        let error = tracker
            .complete_task(
                &TaskId("TASK-nope".to_string()),
                &TaskResolution {
                    outcome: ApprovalStatus::Rejected,
                    resolved_by: "u-sm".to_string(),
                    comment: None,
                },
            )
            .await
            .expect_err("missing");

        assert!(matches!(error, PortError::Missing(_)));
    }
}
