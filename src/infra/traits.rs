//! Trait definitions for the synchronization core's seams
//!
//! Storage and the remote system are both behind async traits so the
//! orchestrator can run against in-memory stores in tests and SQLite in
//! production, and against any accounting-system client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    EntityKey, EntityType, IdempotencyRecord, MirrorRecord, NewLogEntry, TenantId,
    TransactionLogEntry,
};

use super::{RemoteError, Result};

/// Successful response from the remote system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePayload {
    pub body: serde_json::Value,
    /// Remote-supplied version or etag, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
}

impl RemotePayload {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            body,
            source_version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.source_version = Some(version.into());
        self
    }
}

/// Narrow adapter over the external accounting system.
///
/// The orchestrator is the only caller. Implementations carry no business
/// logic: they execute the named operation and classify the failure.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteAdapter: Send + Sync {
    async fn execute(
        &self,
        operation: &str,
        args: &serde_json::Value,
    ) -> std::result::Result<RemotePayload, RemoteError>;
}

/// Append-only transaction log.
///
/// Invariant: entries are never updated or deleted, and at most one OK
/// outbound outcome exists per `(tenant, operation, idempotency_key)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Append an entry and return it with its assigned id
    async fn append(&self, entry: NewLogEntry) -> Result<TransactionLogEntry>;

    /// The completed write for a key, if one succeeded
    async fn idempotency_record(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Every entry recorded for a key, oldest first
    async fn read_by_key(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Vec<TransactionLogEntry>>;

    /// Every entry recorded for an entity, oldest first
    async fn read_entity(&self, key: &EntityKey) -> Result<Vec<TransactionLogEntry>>;

    /// Most recent inbound fetch for an entity
    async fn latest_fetch(&self, key: &EntityKey) -> Result<Option<TransactionLogEntry>>;

    /// Tenant entries with id greater than `after_id`, oldest first
    async fn read_tenant(
        &self,
        tenant_id: &TenantId,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TransactionLogEntry>>;
}

/// Keyed store of mirror records; one row per `(tenant, type, id)`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn get(&self, key: &EntityKey) -> Result<Option<MirrorRecord>>;

    /// Insert or replace the row for the record's key
    async fn upsert(&self, record: MirrorRecord) -> Result<()>;

    async fn set_drift_flag(&self, key: &EntityKey, flagged: bool) -> Result<()>;

    /// Rows needing reconciliation: synced before `synced_before`, drift
    /// flagged, or still provisional
    async fn reconciliation_candidates(
        &self,
        tenant_id: &TenantId,
        entity_type: &EntityType,
        synced_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MirrorRecord>>;

    async fn entity_types(&self, tenant_id: &TenantId) -> Result<Vec<EntityType>>;

    async fn tenants(&self) -> Result<Vec<TenantId>>;

    /// Remove every row for an offboarded tenant
    async fn purge_tenant(&self, tenant_id: &TenantId) -> Result<u64>;
}

/// A time-bounded refresh lease on one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: EntityKey,
    pub holder: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Time-bounded mutual exclusion for refreshes.
///
/// A lease whose `expires_at` has passed may be taken over by another
/// holder, so a crashed worker never blocks a key permanently.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease unless a live one is held by someone else
    async fn try_acquire(
        &self,
        key: &EntityKey,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>>;

    /// Push a held lease's expiry to `now + ttl`.
    ///
    /// Returns `None` when the lease now belongs to another holder. A lease
    /// that expired but was not taken over is still ours and is renewed.
    async fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>>;

    /// Release a lease; a no-op if it was taken over
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Whether a live lease is currently held on the key
    async fn is_held(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<bool>;
}
