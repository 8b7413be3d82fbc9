use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use keystone_core::approvals::{EntityGateway, EntityMutation, MutationEnvelope, PortError};
use keystone_core::domain::request::ApprovalRequestId;

use super::{
    decode_json, encode_json, format_timestamp, parse_optional_timestamp, parse_timestamp,
    parse_u32, RepositoryError,
};
use crate::DbPool;

/// A mutation waiting for the CRM to apply it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    pub idempotency_key: String,
    pub approval_request_id: ApprovalRequestId,
    pub org_id: String,
    pub path: String,
    pub sequence: u32,
    pub mutation: EntityMutation,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Entity gateway that records mutations in `entity_mutation_outbox` for the CRM to consume.
///
/// Writing the same idempotency key twice is a no-op, so a retried propagation never
/// duplicates work downstream.
pub struct SqlEntityOutbox {
    pool: DbPool,
}

impl SqlEntityOutbox {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Undelivered entries in write order.
    pub async fn pending(&self, limit: u32) -> Result<Vec<OutboxEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT idempotency_key, approval_request_id, org_id, path, sequence, payload_json,
                    created_at, delivered_at
             FROM entity_mutation_outbox
             WHERE status = 'pending'
             ORDER BY created_at ASC, approval_request_id ASC, sequence ASC
             LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(entry_from_row).collect()
    }

    /// Returns false when the key is unknown or was already delivered.
    pub async fn mark_delivered(
        &self,
        idempotency_key: &str,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE entity_mutation_outbox SET status = 'delivered', delivered_at = ?
             WHERE idempotency_key = ? AND status = 'pending'",
        )
        .bind(format_timestamp(delivered_at))
        .bind(idempotency_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl EntityGateway for SqlEntityOutbox {
    async fn apply(&self, envelope: &MutationEnvelope) -> Result<(), PortError> {
        sqlx::query(
            "INSERT OR IGNORE INTO entity_mutation_outbox (
                idempotency_key, approval_request_id, org_id, approval_type, path, sequence,
                kind, payload_json, status, created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)",
        )
        .bind(&envelope.idempotency_key)
        .bind(&envelope.approval_request_id.0)
        .bind(&envelope.org_id)
        .bind(envelope.approval_type.as_str())
        .bind(envelope.path.as_str())
        .bind(i64::from(envelope.sequence))
        .bind(envelope.mutation.kind())
        .bind(encode_json("payload_json", &envelope.mutation)?)
        .bind(format_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(())
    }
}

fn entry_from_row(row: SqliteRow) -> Result<OutboxEntry, RepositoryError> {
    Ok(OutboxEntry {
        idempotency_key: row.try_get("idempotency_key")?,
        approval_request_id: ApprovalRequestId(row.try_get("approval_request_id")?),
        org_id: row.try_get("org_id")?,
        path: row.try_get("path")?,
        sequence: parse_u32("sequence", row.try_get("sequence")?)?,
        mutation: decode_json("payload_json", &row.try_get::<String, _>("payload_json")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        delivered_at: parse_optional_timestamp("delivered_at", row.try_get("delivered_at")?)?,
    })
}
