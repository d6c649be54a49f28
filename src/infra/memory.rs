//! In-memory stores
//!
//! Process-local implementations of the storage traits. They enforce the
//! same invariants as the SQLite stores and back the test suite and
//! single-process embeddings.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::domain::{
    Direction, EntityKey, EntityType, IdempotencyRecord, LogKind, MirrorRecord, NewLogEntry,
    TenantId, TransactionLogEntry,
};

use super::{Lease, LeaseStore, MirrorStore, Result, SyncError, TransactionLog};

/// Append-only log held in a vector
#[derive(Default)]
pub struct InMemoryTransactionLog {
    entries: RwLock<Vec<TransactionLogEntry>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of every entry, oldest first
    pub async fn all(&self) -> Vec<TransactionLogEntry> {
        self.entries.read().await.clone()
    }
}

fn matches_key(
    entry: &TransactionLogEntry,
    tenant_id: &TenantId,
    operation: &str,
    idempotency_key: &str,
) -> bool {
    &entry.tenant_id == tenant_id
        && entry.operation == operation
        && entry.idempotency_key.as_deref() == Some(idempotency_key)
}

fn matches_entity(entry: &TransactionLogEntry, key: &EntityKey) -> bool {
    entry.tenant_id == key.tenant_id
        && entry.entity_type.as_ref() == Some(&key.entity_type)
        && entry.entity_id.as_deref() == Some(key.entity_id.as_str())
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn append(&self, entry: NewLogEntry) -> Result<TransactionLogEntry> {
        let mut entries = self.entries.write().await;

        let is_ok_outcome = entry.direction == Direction::Outbound
            && entry.kind == LogKind::Outcome
            && entry.status == crate::domain::LogStatus::Ok;
        if is_ok_outcome {
            if let Some(key) = entry.idempotency_key.as_deref() {
                let duplicate = entries.iter().any(|existing| {
                    existing.is_write_success()
                        && matches_key(existing, &entry.tenant_id, &entry.operation, key)
                });
                if duplicate {
                    return Err(SyncError::InvariantViolation {
                        invariant: "single_ok_outcome".to_string(),
                        message: format!(
                            "an OK outcome already exists for {} key {}",
                            entry.operation, key
                        ),
                    });
                }
            }
        }

        let id = entries.len() as i64 + 1;
        let stored = entry.into_entry(id);
        entries.push(stored.clone());
        Ok(stored)
    }

    async fn idempotency_record(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.is_write_success() && matches_key(e, tenant_id, operation, idempotency_key))
            .find_map(IdempotencyRecord::from_entry))
    }

    async fn read_by_key(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Vec<TransactionLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| matches_key(e, tenant_id, operation, idempotency_key))
            .cloned()
            .collect())
    }

    async fn read_entity(&self, key: &EntityKey) -> Result<Vec<TransactionLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| matches_entity(e, key))
            .cloned()
            .collect())
    }

    async fn latest_fetch(&self, key: &EntityKey) -> Result<Option<TransactionLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .find(|e| e.kind == LogKind::Fetch && matches_entity(e, key))
            .cloned())
    }

    async fn read_tenant(
        &self,
        tenant_id: &TenantId,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TransactionLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| &e.tenant_id == tenant_id && e.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Mirror rows keyed by `(tenant, type, id)`
#[derive(Default)]
pub struct InMemoryMirrorStore {
    rows: RwLock<BTreeMap<EntityKey, MirrorRecord>>,
}

impl InMemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl MirrorStore for InMemoryMirrorStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<MirrorRecord>> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn upsert(&self, record: MirrorRecord) -> Result<()> {
        self.rows.write().await.insert(record.key(), record);
        Ok(())
    }

    async fn set_drift_flag(&self, key: &EntityKey, flagged: bool) -> Result<()> {
        if let Some(row) = self.rows.write().await.get_mut(key) {
            row.drift_flagged = flagged;
        }
        Ok(())
    }

    async fn reconciliation_candidates(
        &self,
        tenant_id: &TenantId,
        entity_type: &EntityType,
        synced_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MirrorRecord>> {
        let rows = self.rows.read().await;
        let mut candidates: Vec<MirrorRecord> = rows
            .values()
            .filter(|r| &r.tenant_id == tenant_id && &r.entity_type == entity_type)
            .filter(|r| r.last_synced_at < synced_before || r.drift_flagged || r.provisional)
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.last_synced_at
                .cmp(&b.last_synced_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn entity_types(&self, tenant_id: &TenantId) -> Result<Vec<EntityType>> {
        let rows = self.rows.read().await;
        let mut types: Vec<EntityType> = rows
            .keys()
            .filter(|k| &k.tenant_id == tenant_id)
            .map(|k| k.entity_type.clone())
            .collect();
        types.dedup();
        Ok(types)
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        let rows = self.rows.read().await;
        let mut tenants: Vec<TenantId> = rows.keys().map(|k| k.tenant_id.clone()).collect();
        tenants.dedup();
        Ok(tenants)
    }

    async fn purge_tenant(&self, tenant_id: &TenantId) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|k, _| &k.tenant_id != tenant_id);
        Ok((before - rows.len()) as u64)
    }
}

/// Leases held in a map; expiry is judged against the caller's clock
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<EntityKey, Lease>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &EntityKey,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SyncError::Configuration(format!("lease ttl out of range: {}", e)))?;
        let mut leases = self.leases.lock().await;

        if let Some(existing) = leases.get(key) {
            if existing.expires_at > now {
                return Ok(None);
            }
            tracing::debug!(key = %key, holder = %existing.holder, "Taking over expired lease");
        }

        let lease = Lease {
            key: key.clone(),
            holder: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        leases.insert(key.clone(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SyncError::Configuration(format!("lease ttl out of range: {}", e)))?;
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lease.key) {
            Some(held) if held.holder == lease.holder => {
                held.expires_at = now + ttl;
                Ok(Some(held.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&lease.key)
            .is_some_and(|held| held.holder == lease.holder)
        {
            leases.remove(&lease.key);
        }
        Ok(())
    }

    async fn is_held(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<bool> {
        let leases = self.leases.lock().await;
        Ok(leases.get(key).is_some_and(|l| l.expires_at > now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LogStatus;

    fn key() -> EntityKey {
        EntityKey::new(TenantId::new(), EntityType::bill(), "bill-1")
    }

    #[tokio::test]
    async fn test_log_rejects_second_ok_outcome() {
        let log = InMemoryTransactionLog::new();
        let tenant = TenantId::new();
        let now = Utc::now();

        let ok = || {
            NewLogEntry::outcome(tenant.clone(), "create_payment", "k1", [7u8; 32], LogStatus::Ok, now)
        };
        log.append(ok()).await.unwrap();
        let err = log.append(ok()).await.unwrap_err();
        assert!(matches!(err, SyncError::InvariantViolation { .. }));

        // A failed outcome for the same key is fine
        log.append(NewLogEntry::outcome(
            tenant.clone(),
            "create_payment",
            "k1",
            [7u8; 32],
            LogStatus::Failed,
            now,
        ))
        .await
        .unwrap();
        assert_eq!(log.read_by_key(&tenant, "create_payment", "k1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_log_ids_are_monotonic() {
        let log = InMemoryTransactionLog::new();
        let k = key();
        let a = log
            .append(NewLogEntry::fetch(&k, "get_bill", LogStatus::Ok, Utc::now()))
            .await
            .unwrap();
        let b = log
            .append(NewLogEntry::fetch(&k, "get_bill", LogStatus::Failed, Utc::now()))
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(log.latest_fetch(&k).await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn test_lease_exclusive_until_expiry() {
        let leases = InMemoryLeaseStore::new();
        let k = key();
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        let first = leases.try_acquire(&k, ttl, now).await.unwrap().unwrap();
        assert!(leases.try_acquire(&k, ttl, now).await.unwrap().is_none());
        assert!(leases.is_held(&k, now).await.unwrap());

        let later = now + chrono::Duration::seconds(31);
        let second = leases.try_acquire(&k, ttl, later).await.unwrap().unwrap();
        assert_ne!(first.holder, second.holder);

        // Stale holder cannot release the new lease
        leases.release(&first).await.unwrap();
        assert!(leases.is_held(&k, later).await.unwrap());
        leases.release(&second).await.unwrap();
        assert!(!leases.is_held(&k, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_renew_refused_after_take_over() {
        let leases = InMemoryLeaseStore::new();
        let k = key();
        let now = Utc::now();
        let ttl = Duration::from_secs(30);

        let first = leases.try_acquire(&k, ttl, now).await.unwrap().unwrap();
        let at = now + chrono::Duration::seconds(25);
        let renewed = leases.renew(&first, ttl, at).await.unwrap().unwrap();
        assert_eq!(renewed.expires_at, at + chrono::Duration::seconds(30));
        assert!(leases.is_held(&k, now + chrono::Duration::seconds(40)).await.unwrap());

        let later = now + chrono::Duration::seconds(60);
        leases.try_acquire(&k, ttl, later).await.unwrap().unwrap();
        assert!(leases.renew(&first, ttl, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mirror_purge_is_tenant_scoped() {
        let mirror = InMemoryMirrorStore::new();
        let a = key();
        let b = EntityKey::new(TenantId::new(), EntityType::bill(), "bill-1");
        for k in [&a, &b] {
            mirror
                .upsert(MirrorRecord {
                    tenant_id: k.tenant_id.clone(),
                    entity_type: k.entity_type.clone(),
                    entity_id: k.entity_id.clone(),
                    fields: serde_json::json!({"amount": 10}),
                    source_version: None,
                    last_synced_at: Utc::now(),
                    provisional: false,
                    drift_flagged: false,
                    log_id: 1,
                })
                .await
                .unwrap();
        }
        assert_eq!(mirror.purge_tenant(&a.tenant_id).await.unwrap(), 1);
        assert!(mirror.get(&a).await.unwrap().is_none());
        assert!(mirror.get(&b).await.unwrap().is_some());
    }
}
