//! Idempotent write requests and in-process single-flight
//!
//! The transaction log is the source of truth for whether a write already
//! happened. [`InFlightWrites`] only closes the window between "no OK
//! outcome in the log yet" and "the first caller finished", so concurrent
//! callers of one key share a single execution instead of racing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::domain::{EntityKey, EntityType, Hash256, IdempotencyRecord, TenantId};
use crate::infra::{RemotePayload, Result};

/// A write to the remote system
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub tenant_id: TenantId,
    pub operation: String,
    /// Caller-supplied key; derived from the request when absent
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
    /// Mirror row this write is expected to change
    pub target: Option<(EntityType, String)>,
}

impl WriteRequest {
    pub fn new(
        tenant_id: TenantId,
        operation: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tenant_id,
            operation: operation.into(),
            idempotency_key: None,
            payload,
            target: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_target(mut self, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        self.target = Some((entity_type, entity_id.into()));
        self
    }

    pub fn target_key(&self) -> Option<EntityKey> {
        self.target.as_ref().map(|(entity_type, entity_id)| {
            EntityKey::new(self.tenant_id.clone(), entity_type.clone(), entity_id.clone())
        })
    }
}

/// Terminal result of a write, identical for the first caller and every
/// replay of the same key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// The OK outcome entry in the transaction log
    pub log_id: i64,
    pub idempotency_key: String,
    /// Remote response body
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

impl From<IdempotencyRecord> for WriteOutcome {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            log_id: record.log_id,
            idempotency_key: record.idempotency_key,
            payload: record.payload,
            source_version: record.source_version,
        }
    }
}

/// How an operator settles a write whose outcome was never recorded
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResolution {
    /// The remote system shows the effect; record its response
    Applied(RemotePayload),
    /// The remote system has no trace of it; the key may execute again
    NotApplied(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct WriteKey {
    pub tenant_id: TenantId,
    pub operation: String,
    pub idempotency_key: String,
}

/// The request hash that was executed, with its shared result
pub(crate) type ExecutedWrite = (Hash256, Result<WriteOutcome>);

pub(crate) type WriteSlot = Arc<OnceCell<ExecutedWrite>>;

/// Per-key execution slots for writes currently in flight
#[derive(Default)]
pub(crate) struct InFlightWrites {
    slots: Mutex<HashMap<WriteKey, WriteSlot>>,
}

impl InFlightWrites {
    /// The slot for a key, created if no write for it is in flight
    pub(crate) fn slot(&self, key: &WriteKey) -> WriteSlot {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Drop the slot once its write settled, unless it was already replaced
    pub(crate) fn finish(&self, key: &WriteKey, slot: &WriteSlot) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    pub(crate) fn contains(&self, key: &WriteKey) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> WriteKey {
        WriteKey {
            tenant_id: TenantId::from_uuid(uuid::Uuid::nil()),
            operation: "create_payment".to_string(),
            idempotency_key: k.to_string(),
        }
    }

    #[tokio::test]
    async fn test_same_key_shares_slot() {
        let writes = InFlightWrites::default();
        let a = writes.slot(&key("k1"));
        let b = writes.slot(&key("k1"));
        let c = writes.slot(&key("k2"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        writes.finish(&key("k1"), &a);
        assert_eq!(writes.len(), 1);
        assert!(!writes.contains(&key("k1")));
        assert!(writes.contains(&key("k2")));
        // A stale handle does not evict a newer slot
        let fresh = writes.slot(&key("k1"));
        writes.finish(&key("k1"), &a);
        assert!(Arc::ptr_eq(&fresh, &writes.slot(&key("k1"))));
    }

    #[test]
    fn test_write_request_target_key() {
        let tenant = TenantId::new();
        let request = WriteRequest::new(tenant.clone(), "approve_bill", serde_json::json!({}))
            .with_target(EntityType::bill(), "bill-7");
        let target = request.target_key().unwrap();
        assert_eq!(target.tenant_id, tenant);
        assert_eq!(target.entity_id, "bill-7");
    }
}
