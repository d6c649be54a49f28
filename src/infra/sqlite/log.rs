//! SQLite transaction log
//!
//! Rows are insert-only; update and delete are rejected by triggers, and a
//! partial unique index enforces the single OK outcome per write key.

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, FromRow};

use crate::domain::{
    Direction, EntityKey, EntityType, FailureKind, Hash256, IdempotencyRecord, LogKind,
    LogStatus, NewLogEntry, TenantId, TransactionLogEntry,
};
use crate::infra::{Result, SyncError, TransactionLog};

use super::{decode_tenant, decode_ts, encode_ts};

const SELECT_COLUMNS: &str = r#"
    SELECT id, tenant_id, direction, kind, operation,
           entity_type, entity_id, idempotency_key, status,
           payload, request_hash, source_version,
           error_kind, error_message, attempts, created_at
    FROM transaction_log
"#;

/// SQLite-backed append-only transaction log
#[derive(Clone)]
pub struct SqliteTransactionLog {
    pool: SqlitePool,
}

impl SqliteTransactionLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TransactionLog for SqliteTransactionLog {
    async fn append(&self, entry: NewLogEntry) -> Result<TransactionLogEntry> {
        let payload_json = serde_json::to_string(&entry.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO transaction_log (
                tenant_id, direction, kind, operation,
                entity_type, entity_id, idempotency_key, status,
                payload, request_hash, source_version,
                error_kind, error_message, attempts, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.tenant_id.0.to_string())
        .bind(entry.direction.as_str())
        .bind(entry.kind.as_str())
        .bind(&entry.operation)
        .bind(entry.entity_type.as_ref().map(|t| t.as_str().to_string()))
        .bind(&entry.entity_id)
        .bind(&entry.idempotency_key)
        .bind(entry.status.as_str())
        .bind(&payload_json)
        .bind(entry.request_hash.map(hex::encode))
        .bind(&entry.source_version)
        .bind(entry.error_kind.map(|k| k.as_str()))
        .bind(&entry.error_message)
        .bind(entry.attempts as i64)
        .bind(encode_ts(entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(entry.into_entry(result.last_insert_rowid()))
    }

    async fn idempotency_record(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let sql = format!(
            "{} WHERE tenant_id = ? AND operation = ? AND idempotency_key = ? \
             AND direction = 'outbound' AND kind = 'outcome' AND status = 'ok'",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, LogRow>(&sql)
            .bind(tenant_id.0.to_string())
            .bind(operation)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let entry = TransactionLogEntry::try_from(row)?;
                Ok(IdempotencyRecord::from_entry(&entry))
            }
            None => Ok(None),
        }
    }

    async fn read_by_key(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Vec<TransactionLogEntry>> {
        let sql = format!(
            "{} WHERE tenant_id = ? AND operation = ? AND idempotency_key = ? ORDER BY id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, LogRow>(&sql)
            .bind(tenant_id.0.to_string())
            .bind(operation)
            .bind(idempotency_key)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransactionLogEntry::try_from).collect()
    }

    async fn read_entity(&self, key: &EntityKey) -> Result<Vec<TransactionLogEntry>> {
        let sql = format!(
            "{} WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? ORDER BY id ASC",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, LogRow>(&sql)
            .bind(key.tenant_id.0.to_string())
            .bind(key.entity_type.as_str())
            .bind(&key.entity_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransactionLogEntry::try_from).collect()
    }

    async fn latest_fetch(&self, key: &EntityKey) -> Result<Option<TransactionLogEntry>> {
        let sql = format!(
            "{} WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? AND kind = 'fetch' \
             ORDER BY id DESC LIMIT 1",
            SELECT_COLUMNS
        );
        let row = sqlx::query_as::<_, LogRow>(&sql)
            .bind(key.tenant_id.0.to_string())
            .bind(key.entity_type.as_str())
            .bind(&key.entity_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(TransactionLogEntry::try_from).transpose()
    }

    async fn read_tenant(
        &self,
        tenant_id: &TenantId,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TransactionLogEntry>> {
        let sql = format!(
            "{} WHERE tenant_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
            SELECT_COLUMNS
        );
        let rows = sqlx::query_as::<_, LogRow>(&sql)
            .bind(tenant_id.0.to_string())
            .bind(after_id)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TransactionLogEntry::try_from).collect()
    }
}

#[derive(Debug, FromRow)]
struct LogRow {
    id: i64,
    tenant_id: String,
    direction: String,
    kind: String,
    operation: String,
    entity_type: Option<String>,
    entity_id: Option<String>,
    idempotency_key: Option<String>,
    status: String,
    payload: String,
    request_hash: Option<String>,
    source_version: Option<String>,
    error_kind: Option<String>,
    error_message: Option<String>,
    attempts: i64,
    created_at: String,
}

fn decode_hash(raw: &str) -> Result<Hash256> {
    let bytes = hex::decode(raw).map_err(|e| SyncError::Serialization(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| SyncError::Serialization("request_hash must be 32 bytes".to_string()))
}

fn unknown(column: &str, value: &str) -> SyncError {
    SyncError::Serialization(format!("unknown {} '{}'", column, value))
}

impl TryFrom<LogRow> for TransactionLogEntry {
    type Error = SyncError;

    fn try_from(row: LogRow) -> Result<Self> {
        Ok(TransactionLogEntry {
            id: row.id,
            tenant_id: decode_tenant(&row.tenant_id)?,
            direction: Direction::parse(&row.direction)
                .ok_or_else(|| unknown("direction", &row.direction))?,
            kind: LogKind::parse(&row.kind).ok_or_else(|| unknown("kind", &row.kind))?,
            operation: row.operation,
            entity_type: row.entity_type.map(EntityType::from),
            entity_id: row.entity_id,
            idempotency_key: row.idempotency_key,
            status: LogStatus::parse(&row.status).ok_or_else(|| unknown("status", &row.status))?,
            payload: serde_json::from_str(&row.payload)?,
            request_hash: row.request_hash.as_deref().map(decode_hash).transpose()?,
            source_version: row.source_version,
            error_kind: row
                .error_kind
                .as_deref()
                .map(|k| FailureKind::parse(k).ok_or_else(|| unknown("error_kind", k)))
                .transpose()?,
            error_message: row.error_message,
            attempts: row.attempts.max(0) as u32,
            created_at: decode_ts(&row.created_at)?,
        })
    }
}
