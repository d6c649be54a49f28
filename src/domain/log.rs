//! Transaction log entries
//!
//! The transaction log is the audit trail of every exchange with the remote
//! system. Entries are immutable once appended; a retried write produces one
//! entry per attempt phase rather than updating an earlier row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    option_hash256_hex, Direction, EntityKey, EntityType, FailureKind, Hash256, LogKind,
    LogStatus, TenantId,
};

/// An appended, immutable log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    /// Monotonic id assigned by the store at append time
    pub id: i64,
    pub tenant_id: TenantId,
    pub direction: Direction,
    pub kind: LogKind,
    /// Named remote action, e.g. `list_bills` or `create_payment`
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Present on outbound entries only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub status: LogStatus,
    /// Raw remote response or request body
    pub payload: serde_json::Value,
    /// Canonical hash of the write request this entry belongs to
    #[serde(
        with = "option_hash256_hex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub request_hash: Option<Hash256>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Remote attempts made before this entry was written
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl TransactionLogEntry {
    /// Whether this is the single successful outcome of a write
    pub fn is_write_success(&self) -> bool {
        self.direction == Direction::Outbound
            && self.kind == LogKind::Outcome
            && self.status == LogStatus::Ok
    }

    pub fn entity_key(&self) -> Option<EntityKey> {
        match (&self.entity_type, &self.entity_id) {
            (Some(entity_type), Some(entity_id)) => Some(EntityKey::new(
                self.tenant_id.clone(),
                entity_type.clone(),
                entity_id.clone(),
            )),
            _ => None,
        }
    }
}

/// An entry ready to append; the store assigns the id
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub tenant_id: TenantId,
    pub direction: Direction,
    pub kind: LogKind,
    pub operation: String,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub status: LogStatus,
    pub payload: serde_json::Value,
    pub request_hash: Option<Hash256>,
    pub source_version: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl NewLogEntry {
    fn base(
        tenant_id: TenantId,
        direction: Direction,
        kind: LogKind,
        operation: impl Into<String>,
        status: LogStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant_id,
            direction,
            kind,
            operation: operation.into(),
            entity_type: None,
            entity_id: None,
            idempotency_key: None,
            status,
            payload: serde_json::Value::Null,
            request_hash: None,
            source_version: None,
            error_kind: None,
            error_message: None,
            attempts: 0,
            created_at,
        }
    }

    /// Result of a remote read for one entity
    pub fn fetch(
        key: &EntityKey,
        operation: impl Into<String>,
        status: LogStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::base(
            key.tenant_id.clone(),
            Direction::Inbound,
            LogKind::Fetch,
            operation,
            status,
            created_at,
        )
        .entity(key)
    }

    /// Drift observed by reconciliation for one entity
    pub fn drift(key: &EntityKey, operation: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self::base(
            key.tenant_id.clone(),
            Direction::Inbound,
            LogKind::Drift,
            operation,
            LogStatus::Ok,
            created_at,
        )
        .entity(key)
    }

    /// Pre-execution write intent
    pub fn intent(
        tenant_id: TenantId,
        operation: impl Into<String>,
        idempotency_key: impl Into<String>,
        request_hash: Hash256,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::base(
            tenant_id,
            Direction::Outbound,
            LogKind::Intent,
            operation,
            LogStatus::Retry,
            created_at,
        );
        entry.idempotency_key = Some(idempotency_key.into());
        entry.request_hash = Some(request_hash);
        entry
    }

    /// Terminal write result (`Ok` or `Failed`)
    pub fn outcome(
        tenant_id: TenantId,
        operation: impl Into<String>,
        idempotency_key: impl Into<String>,
        request_hash: Hash256,
        status: LogStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::base(
            tenant_id,
            Direction::Outbound,
            LogKind::Outcome,
            operation,
            status,
            created_at,
        );
        entry.idempotency_key = Some(idempotency_key.into());
        entry.request_hash = Some(request_hash);
        entry
    }

    pub fn entity(mut self, key: &EntityKey) -> Self {
        self.entity_type = Some(key.entity_type.clone());
        self.entity_id = Some(key.entity_id.clone());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn source_version(mut self, version: Option<String>) -> Self {
        self.source_version = version;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn failed(mut self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self
    }

    /// Materialize with the id assigned by the store
    pub fn into_entry(self, id: i64) -> TransactionLogEntry {
        TransactionLogEntry {
            id,
            tenant_id: self.tenant_id,
            direction: self.direction,
            kind: self.kind,
            operation: self.operation,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            idempotency_key: self.idempotency_key,
            status: self.status,
            payload: self.payload,
            request_hash: self.request_hash,
            source_version: self.source_version,
            error_kind: self.error_kind,
            error_message: self.error_message,
            attempts: self.attempts,
            created_at: self.created_at,
        }
    }
}

/// The completed result of a write, keyed by `(tenant, operation, key)`.
///
/// Derived from the single OK outbound outcome in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub tenant_id: TenantId,
    pub operation: String,
    pub idempotency_key: String,
    pub log_id: i64,
    pub payload: serde_json::Value,
    #[serde(with = "super::hash256_hex")]
    pub request_hash: Hash256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

impl IdempotencyRecord {
    /// Build from a log entry; `None` unless it is a successful write outcome
    pub fn from_entry(entry: &TransactionLogEntry) -> Option<Self> {
        if !entry.is_write_success() {
            return None;
        }
        Some(Self {
            tenant_id: entry.tenant_id.clone(),
            operation: entry.operation.clone(),
            idempotency_key: entry.idempotency_key.clone()?,
            log_id: entry.id,
            payload: entry.payload.clone(),
            request_hash: entry.request_hash?,
            source_version: entry.source_version.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_record_only_from_ok_outcome() {
        let tenant = TenantId::new();
        let now = Utc::now();

        let intent = NewLogEntry::intent(tenant.clone(), "create_payment", "k1", [1u8; 32], now)
            .into_entry(1);
        assert!(IdempotencyRecord::from_entry(&intent).is_none());

        let failed = NewLogEntry::outcome(
            tenant.clone(),
            "create_payment",
            "k1",
            [1u8; 32],
            LogStatus::Failed,
            now,
        )
        .into_entry(2);
        assert!(IdempotencyRecord::from_entry(&failed).is_none());

        let ok = NewLogEntry::outcome(tenant, "create_payment", "k1", [1u8; 32], LogStatus::Ok, now)
            .payload(serde_json::json!({"payment_id": "p-1"}))
            .into_entry(3);
        let record = IdempotencyRecord::from_entry(&ok).unwrap();
        assert_eq!(record.log_id, 3);
        assert_eq!(record.payload["payment_id"], "p-1");
    }

    #[test]
    fn test_fetch_entry_carries_entity() {
        let key = EntityKey::new(TenantId::new(), EntityType::invoice(), "inv-9");
        let entry = NewLogEntry::fetch(&key, "get_invoice", LogStatus::Ok, Utc::now())
            .attempts(2)
            .into_entry(7);
        assert_eq!(entry.direction, Direction::Inbound);
        assert_eq!(entry.entity_key(), Some(key));
        assert_eq!(entry.attempts, 2);
        assert!(entry.idempotency_key.is_none());
    }
}
