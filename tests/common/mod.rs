//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use stateset_ledger_sync::config::PolicyHandle;
use stateset_ledger_sync::domain::{EntityKey, EntityType, MirrorRecord, PolicySet, TenantId};
use stateset_ledger_sync::infra::{ManualClock, RetryConfig};
use stateset_ledger_sync::{
    OrchestratorConfig, RemoteAdapter, RemoteError, RemotePayload, SyncOrchestrator, SyncStores,
};

/// Test tenant ID
pub fn test_tenant_id() -> TenantId {
    TenantId::from_uuid(Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap())
}

/// Second tenant for isolation checks
pub fn other_tenant_id() -> TenantId {
    TenantId::from_uuid(Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap())
}

/// Fixed starting instant for the manual clock
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 9, 0, 0).unwrap()
}

pub fn bill_key(entity_id: &str) -> EntityKey {
    EntityKey::new(test_tenant_id(), EntityType::bill(), entity_id)
}

pub fn bill_payload(amount: f64, status: &str) -> serde_json::Value {
    json!({
        "vendor": "Acme Supplies",
        "amount": amount,
        "currency": "USD",
        "status": status,
    })
}

pub fn payment_payload(bill_id: &str, amount: f64) -> serde_json::Value {
    json!({
        "bill_id": bill_id,
        "amount": amount,
        "currency": "USD",
        "method": "ach",
    })
}

/// Mirror row for seeding a store directly
pub fn mirror_record(
    key: &EntityKey,
    fields: serde_json::Value,
    last_synced_at: DateTime<Utc>,
) -> MirrorRecord {
    MirrorRecord {
        tenant_id: key.tenant_id.clone(),
        entity_type: key.entity_type.clone(),
        entity_id: key.entity_id.clone(),
        fields,
        source_version: None,
        last_synced_at,
        provisional: false,
        drift_flagged: false,
        log_id: 0,
    }
}

type Scripted = Result<RemotePayload, RemoteError>;

/// Remote adapter that replays scripted responses per operation and records
/// every call it receives.
///
/// Queued responses are consumed first; once a queue is empty the operation's
/// standing response (if any) is returned. Unscripted operations fail
/// permanently.
#[derive(Default)]
pub struct ScriptedRemote {
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    standing: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
    delay: Mutex<Duration>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for an operation
    pub fn push(&self, operation: &str, response: Scripted) -> &Self {
        self.queued
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Response returned whenever the queue for an operation is empty
    pub fn always(&self, operation: &str, response: Scripted) -> &Self {
        self.standing
            .lock()
            .unwrap()
            .insert(operation.to_string(), response);
        self
    }

    /// Latency added to every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| op == operation)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteAdapter for ScriptedRemote {
    async fn execute(&self, operation: &str, args: &serde_json::Value) -> Scripted {
        self.calls
            .lock()
            .unwrap()
            .push((operation.to_string(), args.clone()));

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let queued = self
            .queued
            .lock()
            .unwrap()
            .get_mut(operation)
            .and_then(|queue| queue.pop_front());
        if let Some(response) = queued {
            return response;
        }
        self.standing
            .lock()
            .unwrap()
            .get(operation)
            .cloned()
            .unwrap_or_else(|| Err(RemoteError::Permanent(format!("unscripted operation {operation}"))))
    }
}

/// Orchestrator settings with near-zero backoff and short lease waits
pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryConfig::fast(),
        lease_ttl: Duration::from_secs(30),
        lease_wait: Duration::from_millis(500),
        lease_poll_interval: Duration::from_millis(2),
        remote_timeout: Duration::from_secs(5),
        simple_mode: false,
    }
}

/// Orchestrator wired to a scripted remote and a manual clock
pub struct Harness {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub remote: Arc<ScriptedRemote>,
    pub clock: ManualClock,
    pub stores: SyncStores,
    pub policies: PolicyHandle,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(SyncStores::in_memory(), PolicySet::default(), test_config())
    }

    pub fn with_policies(policies: PolicySet) -> Self {
        Self::build(SyncStores::in_memory(), policies, test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        Self::build(SyncStores::in_memory(), PolicySet::default(), config)
    }

    pub fn build(stores: SyncStores, policies: PolicySet, config: OrchestratorConfig) -> Self {
        let remote = Arc::new(ScriptedRemote::new());
        let clock = ManualClock::new(t0());
        let policies = PolicyHandle::new(policies);
        let orchestrator = SyncOrchestrator::new(
            stores.clone(),
            remote.clone(),
            policies.clone(),
            config,
        )
        .with_clock(Arc::new(clock.clone()));

        Self {
            orchestrator: Arc::new(orchestrator),
            remote,
            clock,
            stores,
            policies,
        }
    }

    /// Orchestrator backed by a fresh in-memory SQLite database
    pub async fn sqlite() -> Self {
        let pool = stateset_ledger_sync::infra::sqlite::connect("sqlite::memory:", 1)
            .await
            .unwrap();
        Self::build(SyncStores::sqlite(pool), PolicySet::default(), test_config())
    }

    pub async fn seed_mirror(&self, record: MirrorRecord) {
        self.stores.mirror.upsert(record).await.unwrap();
    }
}
