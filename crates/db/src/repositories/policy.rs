use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use keystone_core::approvals::{PolicyStore, PortError};
use keystone_core::domain::policy::{ApprovalPolicy, ApprovalType, EscalationTiming, PolicyId};

use super::{
    decode_json, encode_json, format_timestamp, parse_decimal, parse_timestamp, parse_u32,
    RepositoryError,
};
use crate::DbPool;

const POLICY_COLUMNS: &str = "id, org_id, project_id, approval_type, enabled,
    discount_ceilings_json, max_price_deviation_pct, amount_brackets_json, always_require,
    approver_rules_json, required_approvals, sla_hours, escalation_level1_hours,
    escalation_level2_hours, escalation_level3_hours, created_at, updated_at";

pub struct SqlPolicyStore {
    pool: DbPool,
}

impl SqlPolicyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_scoped(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        project_id: Option<&str>,
    ) -> Result<Option<ApprovalPolicy>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM approval_policy
             WHERE org_id = ? AND approval_type = ? AND project_id IS ?"
        ))
        .bind(org_id)
        .bind(approval_type.as_str())
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(policy_from_row).transpose()
    }

    async fn upsert(&self, mut policy: ApprovalPolicy) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let existing_id: Option<String> = sqlx::query_scalar(
            "SELECT id FROM approval_policy
             WHERE org_id = ? AND approval_type = ? AND project_id IS ?",
        )
        .bind(&policy.org_id)
        .bind(policy.approval_type.as_str())
        .bind(policy.project_id.as_deref())
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(id) = existing_id {
            policy.id = PolicyId(id);
        }

        sqlx::query(&format!(
            "INSERT INTO approval_policy ({POLICY_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                discount_ceilings_json = excluded.discount_ceilings_json,
                max_price_deviation_pct = excluded.max_price_deviation_pct,
                amount_brackets_json = excluded.amount_brackets_json,
                always_require = excluded.always_require,
                approver_rules_json = excluded.approver_rules_json,
                required_approvals = excluded.required_approvals,
                sla_hours = excluded.sla_hours,
                escalation_level1_hours = excluded.escalation_level1_hours,
                escalation_level2_hours = excluded.escalation_level2_hours,
                escalation_level3_hours = excluded.escalation_level3_hours,
                updated_at = excluded.updated_at"
        ))
        .bind(&policy.id.0)
        .bind(&policy.org_id)
        .bind(policy.project_id.as_deref())
        .bind(policy.approval_type.as_str())
        .bind(policy.enabled)
        .bind(encode_json("discount_ceilings_json", &policy.discount_ceilings)?)
        .bind(policy.max_price_deviation_pct.map(|value| value.to_string()))
        .bind(encode_json("amount_brackets_json", &policy.amount_brackets)?)
        .bind(policy.always_require)
        .bind(encode_json("approver_rules_json", &policy.approver_rules)?)
        .bind(i64::from(policy.required_approvals))
        .bind(i64::from(policy.sla_hours))
        .bind(i64::from(policy.escalation.level1_hours))
        .bind(i64::from(policy.escalation.level2_hours))
        .bind(i64::from(policy.escalation.level3_hours))
        .bind(format_timestamp(policy.created_at))
        .bind(format_timestamp(policy.updated_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for SqlPolicyStore {
    async fn get_policy(
        &self,
        org_id: &str,
        approval_type: ApprovalType,
        project_id: Option<&str>,
    ) -> Result<Option<ApprovalPolicy>, PortError> {
        Ok(self.fetch_scoped(org_id, approval_type, project_id).await?)
    }

    async fn find_by_id(&self, id: &PolicyId) -> Result<Option<ApprovalPolicy>, PortError> {
        let row = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM approval_policy WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        Ok(row.map(policy_from_row).transpose()?)
    }

    async fn save_policy(&self, policy: ApprovalPolicy) -> Result<(), PortError> {
        Ok(self.upsert(policy).await?)
    }
}

fn policy_from_row(row: SqliteRow) -> Result<ApprovalPolicy, RepositoryError> {
    let type_raw = row.try_get::<String, _>("approval_type")?;
    let approval_type = ApprovalType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approval type `{type_raw}`")))?;
    let max_price_deviation_pct = row
        .try_get::<Option<String>, _>("max_price_deviation_pct")?
        .map(|value| parse_decimal("max_price_deviation_pct", &value))
        .transpose()?;

    Ok(ApprovalPolicy {
        id: PolicyId(row.try_get("id")?),
        org_id: row.try_get("org_id")?,
        project_id: row.try_get("project_id")?,
        approval_type,
        enabled: row.try_get("enabled")?,
        discount_ceilings: decode_json(
            "discount_ceilings_json",
            &row.try_get::<String, _>("discount_ceilings_json")?,
        )?,
        max_price_deviation_pct,
        amount_brackets: decode_json(
            "amount_brackets_json",
            &row.try_get::<String, _>("amount_brackets_json")?,
        )?,
        always_require: row.try_get("always_require")?,
        approver_rules: decode_json(
            "approver_rules_json",
            &row.try_get::<String, _>("approver_rules_json")?,
        )?,
        required_approvals: parse_u32("required_approvals", row.try_get("required_approvals")?)?,
        sla_hours: parse_u32("sla_hours", row.try_get("sla_hours")?)?,
        escalation: EscalationTiming {
            level1_hours: parse_u32(
                "escalation_level1_hours",
                row.try_get("escalation_level1_hours")?,
            )?,
            level2_hours: parse_u32(
                "escalation_level2_hours",
                row.try_get("escalation_level2_hours")?,
            )?,
            level3_hours: parse_u32(
                "escalation_level3_hours",
                row.try_get("escalation_level3_hours")?,
            )?,
        },
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
