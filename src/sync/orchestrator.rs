//! Sync Orchestrator
//!
//! The only component that talks to the remote system and the only writer of
//! the transaction log and the mirror. Reads go through [`read_refresh`],
//! writes through [`write_idempotent`].
//!
//! Ordering rules enforced here:
//! - an INBOUND log entry is appended before the mirror upsert it produces
//! - an OUTBOUND intent is appended before the remote call
//! - the terminal OUTBOUND entry is appended before any provisional upsert
//!
//! [`read_refresh`]: SyncOrchestrator::read_refresh
//! [`write_idempotent`]: SyncOrchestrator::write_idempotent

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::config::PolicyHandle;
use crate::crypto::{derive_idempotency_key, request_hash};
use crate::domain::{
    DriftEvent, EntityKey, EntityType, FailureKind, FieldDrift, FreshnessHint, Hash256,
    LogKind, LogStatus, MirrorRecord, MirrorView, NewLogEntry, SyncPolicy, SyncState, TenantId,
    TransactionLogEntry,
};
use crate::infra::{
    Clock, InMemoryLeaseStore, InMemoryMirrorStore, InMemoryTransactionLog, Lease, LeaseStore,
    MirrorStore, RemoteAdapter, RemoteError, RemotePayload, Result, Retry, RetryConfig,
    RetryDirective, RetryResult, SqliteLeaseStore, SqliteMirrorStore, SqliteTransactionLog,
    SyncError, SystemClock, TransactionLog,
};
use crate::metrics::{metric_names, MetricsRegistry};

use super::idempotency::{
    ExecutedWrite, InFlightWrites, WriteKey, WriteOutcome, WriteRequest, WriteResolution,
};

/// Upper bound on the lease poll interval while waiting for another refresh
const MAX_LEASE_POLL: Duration = Duration::from_millis(250);

/// The three stores the orchestrator owns
#[derive(Clone)]
pub struct SyncStores {
    pub log: Arc<dyn TransactionLog>,
    pub mirror: Arc<dyn MirrorStore>,
    pub leases: Arc<dyn LeaseStore>,
}

impl SyncStores {
    pub fn new(
        log: Arc<dyn TransactionLog>,
        mirror: Arc<dyn MirrorStore>,
        leases: Arc<dyn LeaseStore>,
    ) -> Self {
        Self { log, mirror, leases }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTransactionLog::new()),
            Arc::new(InMemoryMirrorStore::new()),
            Arc::new(InMemoryLeaseStore::new()),
        )
    }

    /// All three stores on one migrated SQLite pool
    pub fn sqlite(pool: SqlitePool) -> Self {
        Self::new(
            Arc::new(SqliteTransactionLog::new(pool.clone())),
            Arc::new(SqliteMirrorStore::new(pool.clone())),
            Arc::new(SqliteLeaseStore::new(pool)),
        )
    }
}

/// Orchestrator tuning that is not per entity type
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Backoff curve; `max_retries` is overridden by the entity policy
    pub retry: RetryConfig,
    /// Lifetime of a refresh lease; an expired lease may be taken over.
    /// The holder renews it every third of this while the refresh runs.
    pub lease_ttl: Duration,
    /// How long a reader waits on another worker's lease
    pub lease_wait: Duration,
    /// First poll interval while waiting; doubles up to 250ms
    pub lease_poll_interval: Duration,
    /// Timeout for a single remote attempt
    pub remote_timeout: Duration,
    /// Forces zero retries regardless of policy
    pub simple_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            lease_ttl: Duration::from_secs(30),
            lease_wait: Duration::from_secs(2),
            lease_poll_interval: Duration::from_millis(25),
            remote_timeout: Duration::from_secs(10),
            simple_mode: false,
        }
    }
}

fn within(age: chrono::Duration, ttl: Duration) -> bool {
    age.to_std().map(|age| age < ttl).unwrap_or(true)
}

/// Whether `current` is a confirmed refresh that landed after `seen` was read
fn refreshed_since(seen: Option<&MirrorRecord>, current: &MirrorRecord) -> bool {
    !current.provisional && seen.map(|prior| prior.log_id != current.log_id).unwrap_or(true)
}

/// The last intent for a write key, if no outcome follows it
fn unsettled_intent(history: &[TransactionLogEntry]) -> Option<&TransactionLogEntry> {
    history.last().filter(|entry| entry.kind == LogKind::Intent)
}

fn retry_directive(err: &RemoteError) -> RetryDirective {
    match err {
        RemoteError::Permanent(_) => RetryDirective::Abort,
        RemoteError::RateLimited {
            retry_after: Some(hint),
        } => RetryDirective::After(*hint),
        _ => RetryDirective::Backoff,
    }
}

/// Renews a refresh lease in the background until dropped
struct LeaseKeepAlive(JoinHandle<()>);

impl Drop for LeaseKeepAlive {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Coordinates freshness, leases, retries, logging and mirror updates.
///
/// Clones share stores, metrics and in-flight writes.
#[derive(Clone)]
pub struct SyncOrchestrator {
    stores: SyncStores,
    remote: Arc<dyn RemoteAdapter>,
    policies: PolicyHandle,
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    in_flight: Arc<InFlightWrites>,
}

impl SyncOrchestrator {
    pub fn new(
        stores: SyncStores,
        remote: Arc<dyn RemoteAdapter>,
        policies: PolicyHandle,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            stores,
            remote,
            policies,
            config,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(MetricsRegistry::new()),
            in_flight: Arc::new(InFlightWrites::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn stores(&self) -> &SyncStores {
        &self.stores
    }

    pub fn policies(&self) -> &PolicyHandle {
        &self.policies
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub(crate) fn policy_for(&self, entity_type: &EntityType) -> SyncPolicy {
        self.policies.current().policy_for(entity_type).clone()
    }

    fn retries_for(&self, policy: &SyncPolicy) -> u32 {
        if self.config.simple_mode {
            0
        } else {
            policy.effective_retries()
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Return the mirror for an entity, refreshing from the remote system
    /// when the hint or the soft TTL demands it.
    ///
    /// Remote failures never fail the read while a mirror exists: the last
    /// known record comes back annotated `stale` with the failure kind. With
    /// no mirror the failure surfaces as [`SyncError::NotAvailable`].
    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, entity_type = %entity_type, entity_id = %entity_id)
    )]
    pub async fn read_refresh(
        &self,
        tenant_id: &TenantId,
        entity_type: &EntityType,
        entity_id: &str,
        hint: FreshnessHint,
    ) -> Result<MirrorView> {
        let key = EntityKey::new(tenant_id.clone(), entity_type.clone(), entity_id);
        let policy = self.policy_for(entity_type);
        let mirror = self.stores.mirror.get(&key).await?;

        if hint == FreshnessHint::CachedOk {
            if let Some(record) = &mirror {
                if within(record.age(self.clock.now()), policy.soft_ttl()) {
                    self.metrics.inc_counter(metric_names::READS_CACHED).await;
                    return Ok(MirrorView::fresh(record.clone()));
                }
            }
        }

        self.refresh_under_lease(&key, &policy, hint, mirror).await
    }

    /// Acquire the refresh lease, waiting on (or taking over from) another
    /// holder, and refresh under it.
    async fn refresh_under_lease(
        &self,
        key: &EntityKey,
        policy: &SyncPolicy,
        hint: FreshnessHint,
        seen: Option<MirrorRecord>,
    ) -> Result<MirrorView> {
        let started = tokio::time::Instant::now();
        let mut poll = self.config.lease_poll_interval.max(Duration::from_millis(1));

        loop {
            let now = self.clock.now();
            if let Some(lease) = self
                .stores
                .leases
                .try_acquire(key, self.config.lease_ttl, now)
                .await?
            {
                let keep_alive = self.keep_alive(&lease);
                let result = self
                    .refresh_locked(key, policy, hint, seen.as_ref(), &lease)
                    .await;
                drop(keep_alive);
                self.release(&lease).await;
                return result;
            }

            // The holder may have finished while we waited
            if let Some(current) = self.stores.mirror.get(key).await? {
                if refreshed_since(seen.as_ref(), &current) {
                    debug!(key = %key, "Refresh completed by lease holder");
                    return Ok(MirrorView::fresh(current));
                }
            }

            let waited = started.elapsed();
            if waited >= self.config.lease_wait {
                return self.lease_contention(key, policy, seen, waited).await;
            }

            tokio::time::sleep(poll.min(self.config.lease_wait - waited)).await;
            poll = (poll * 2).min(MAX_LEASE_POLL);
        }
    }

    async fn lease_contention(
        &self,
        key: &EntityKey,
        policy: &SyncPolicy,
        seen: Option<MirrorRecord>,
        waited: Duration,
    ) -> Result<MirrorView> {
        self.metrics.inc_counter(metric_names::LEASE_CONTENTION).await;
        warn!(
            key = %key,
            waited_ms = waited.as_millis() as u64,
            "Refresh lease still held, returning last known mirror"
        );
        self.contended_view(key, policy, seen, waited)
    }

    /// The lease was taken over mid-refresh; the new holder owns the commit
    async fn lease_lost(
        &self,
        key: &EntityKey,
        policy: &SyncPolicy,
        prior: Option<MirrorRecord>,
    ) -> Result<MirrorView> {
        self.metrics.inc_counter(metric_names::LEASE_LOST).await;
        warn!(key = %key, "Refresh lease taken over, discarding remote result");
        self.contended_view(key, policy, prior, Duration::ZERO)
    }

    fn contended_view(
        &self,
        key: &EntityKey,
        policy: &SyncPolicy,
        seen: Option<MirrorRecord>,
        waited: Duration,
    ) -> Result<MirrorView> {
        match seen {
            Some(record) => {
                let past_hard = !within(record.age(self.clock.now()), policy.hard_ttl());
                Ok(MirrorView::degraded(
                    record,
                    FailureKind::LeaseContention,
                    past_hard,
                ))
            }
            None => Err(SyncError::LeaseContention {
                key: key.clone(),
                waited_ms: waited.as_millis() as u64,
            }),
        }
    }

    fn keep_alive(&self, lease: &Lease) -> LeaseKeepAlive {
        let leases = Arc::clone(&self.stores.leases);
        let clock = Arc::clone(&self.clock);
        let ttl = self.config.lease_ttl;
        let period = (ttl / 3).max(Duration::from_millis(1));
        let lease = lease.clone();

        LeaseKeepAlive(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match leases.renew(&lease, ttl, clock.now()).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(key = %lease.key, "Refresh lease taken over while held");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %lease.key, error = %e, "Failed to renew refresh lease");
                    }
                }
            }
        }))
    }

    /// Renew once more before committing; false if another worker took over
    async fn still_holds(&self, lease: &Lease) -> Result<bool> {
        Ok(self
            .stores
            .leases
            .renew(lease, self.config.lease_ttl, self.clock.now())
            .await?
            .is_some())
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.stores.leases.release(lease).await {
            // The lease expires on its own; a failed release only delays the next refresh
            warn!(key = %lease.key, error = %e, "Failed to release refresh lease");
        }
    }

    /// Remote fetch, log, and mirror upsert for a key whose lease we hold
    async fn refresh_locked(
        &self,
        key: &EntityKey,
        policy: &SyncPolicy,
        hint: FreshnessHint,
        seen: Option<&MirrorRecord>,
        lease: &Lease,
    ) -> Result<MirrorView> {
        // Re-read under the lease: a previous holder may just have refreshed
        let prior = self.stores.mirror.get(key).await?;
        if let Some(record) = &prior {
            if refreshed_since(seen, record) {
                debug!(key = %key, "Refresh completed by previous lease holder");
                return Ok(MirrorView::fresh(record.clone()));
            }
            if hint == FreshnessHint::CachedOk
                && within(record.age(self.clock.now()), policy.soft_ttl())
            {
                self.metrics.inc_counter(metric_names::READS_CACHED).await;
                return Ok(MirrorView::fresh(record.clone()));
            }
        }

        let operation = policy.fetch_operation_for(&key.entity_type);
        let args = serde_json::json!({
            "tenant_id": key.tenant_id.0.to_string(),
            "entity_type": key.entity_type.as_str(),
            "entity_id": key.entity_id,
        });
        let outcome = self
            .call_remote(&operation, &args, self.retries_for(policy))
            .await;
        if !self.still_holds(lease).await? {
            return self.lease_lost(key, policy, prior).await;
        }
        let now = self.clock.now();

        match outcome.result {
            Ok(response) => {
                let entry = self
                    .stores
                    .log
                    .append(
                        NewLogEntry::fetch(key, &operation, LogStatus::Ok, now)
                            .payload(response.body.clone())
                            .source_version(response.source_version.clone())
                            .attempts(outcome.attempts),
                    )
                    .await?;

                let record = MirrorRecord {
                    tenant_id: key.tenant_id.clone(),
                    entity_type: key.entity_type.clone(),
                    entity_id: key.entity_id.clone(),
                    fields: response.body,
                    source_version: response.source_version,
                    last_synced_at: entry.created_at,
                    provisional: false,
                    drift_flagged: prior.map(|p| p.drift_flagged).unwrap_or(false),
                    log_id: entry.id,
                };
                self.stores.mirror.upsert(record.clone()).await?;
                self.metrics.inc_counter(metric_names::READS_REFRESHED).await;
                debug!(key = %key, log_id = entry.id, attempts = outcome.attempts, "Mirror refreshed");
                Ok(MirrorView::fresh(record))
            }
            Err(err) => {
                let kind = err.kind();
                self.stores
                    .log
                    .append(
                        NewLogEntry::fetch(key, &operation, LogStatus::Failed, now)
                            .attempts(outcome.attempts)
                            .failed(kind, err.to_string()),
                    )
                    .await?;

                match prior {
                    Some(record) => {
                        let past_hard = !within(record.age(now), policy.hard_ttl());
                        self.metrics.inc_counter(metric_names::READS_DEGRADED).await;
                        warn!(
                            key = %key,
                            error = %err,
                            attempts = outcome.attempts,
                            past_hard_ttl = past_hard,
                            "Refresh failed, serving stale mirror"
                        );
                        Ok(MirrorView::degraded(record, kind, past_hard))
                    }
                    None => {
                        self.metrics
                            .inc_counter(metric_names::READS_NOT_AVAILABLE)
                            .await;
                        warn!(key = %key, error = %err, "Refresh failed and no mirror exists");
                        Err(SyncError::NotAvailable {
                            key: key.clone(),
                            last_error: kind,
                        })
                    }
                }
            }
        }
    }

    /// Call the remote with a per-attempt timeout and bounded retry
    async fn call_remote(
        &self,
        operation: &str,
        args: &serde_json::Value,
        max_retries: u32,
    ) -> RetryResult<RemotePayload, RemoteError> {
        let retry = Retry::new(self.config.retry.clone().with_max_retries(max_retries));
        let timeout = self.config.remote_timeout;
        let remote = &self.remote;
        let metrics = &self.metrics;

        retry
            .run_with_directive(
                |attempt| async move {
                    metrics.inc_counter(metric_names::REMOTE_CALLS).await;
                    if attempt > 1 {
                        metrics.inc_counter(metric_names::REMOTE_RETRIES).await;
                    }
                    let started = std::time::Instant::now();
                    let result =
                        match tokio::time::timeout(timeout, remote.execute(operation, args)).await {
                            Ok(result) => result,
                            Err(_) => Err(RemoteError::Timeout(timeout)),
                        };
                    metrics
                        .observe_duration(metric_names::REMOTE_LATENCY, started.elapsed())
                        .await;
                    if let Err(e) = &result {
                        debug!(operation, attempt, error = %e, "Remote attempt failed");
                    }
                    result
                },
                retry_directive,
            )
            .await
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Execute a remote write at most once per `(tenant, operation, key)`.
    ///
    /// Without a key one is derived from the tenant, operation and canonical
    /// payload. A key already completed returns its recorded result without
    /// calling the remote system; a key reused with a different payload is
    /// rejected with [`SyncError::IdempotencyConflict`]. A key whose intent
    /// was recorded but never settled (a crash mid-call) is rejected with
    /// [`SyncError::WriteInDoubt`] until [`resolve_in_doubt`] settles it.
    ///
    /// The execution runs on its own task: a caller that is cancelled or
    /// times out does not abandon a remote call already in flight, and the
    /// next caller of the same key receives its result.
    ///
    /// [`resolve_in_doubt`]: Self::resolve_in_doubt
    pub async fn write_idempotent(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: Option<String>,
        payload: serde_json::Value,
    ) -> Result<WriteOutcome> {
        let mut request = WriteRequest::new(tenant_id.clone(), operation, payload);
        request.idempotency_key = idempotency_key;
        self.write(request).await
    }

    /// [`write_idempotent`](Self::write_idempotent) with an optional mirror
    /// target that is upserted as provisional on success
    #[instrument(
        skip(self, request),
        fields(tenant_id = %request.tenant_id, operation = %request.operation)
    )]
    pub async fn write(&self, request: WriteRequest) -> Result<WriteOutcome> {
        let idempotency_key = match &request.idempotency_key {
            Some(key) => key.clone(),
            None => derive_idempotency_key(&request.tenant_id, &request.operation, &request.payload)?,
        };
        let hash = request_hash(&request.payload)?;

        if let Some(record) = self
            .stores
            .log
            .idempotency_record(&request.tenant_id, &request.operation, &idempotency_key)
            .await?
        {
            if record.request_hash != hash {
                return Err(self.conflict(&request.operation, &idempotency_key).await);
            }
            return Ok(self.replay(record.into()).await);
        }

        let operation = request.operation.clone();
        let write_key = WriteKey {
            tenant_id: request.tenant_id.clone(),
            operation: operation.clone(),
            idempotency_key: idempotency_key.clone(),
        };
        let slot = self.in_flight.slot(&write_key);
        let this = self.clone();
        let execution = tokio::spawn(
            async move {
                let executed = slot
                    .get_or_init(|| {
                        this.execute_write(&request, &write_key.idempotency_key, hash)
                    })
                    .await
                    .clone();
                this.in_flight.finish(&write_key, &slot);
                executed
            }
            .in_current_span(),
        );
        let (executed_hash, result) = execution
            .await
            .map_err(|e| SyncError::Internal(format!("write task failed: {e}")))?;

        if executed_hash != hash {
            return Err(self.conflict(&operation, &idempotency_key).await);
        }
        result
    }

    async fn replay(&self, outcome: WriteOutcome) -> WriteOutcome {
        self.metrics.inc_counter(metric_names::WRITES_REPLAYED).await;
        info!(
            idempotency_key = %outcome.idempotency_key,
            log_id = outcome.log_id,
            "Replaying completed write"
        );
        outcome
    }

    async fn conflict(&self, operation: &str, idempotency_key: &str) -> SyncError {
        self.metrics
            .inc_counter(metric_names::IDEMPOTENCY_CONFLICTS)
            .await;
        warn!(
            operation,
            idempotency_key,
            "Idempotency key reused with a different payload"
        );
        SyncError::IdempotencyConflict {
            operation: operation.to_string(),
            key: idempotency_key.to_string(),
        }
    }

    /// Runs once per in-flight key; every concurrent caller shares the result
    async fn execute_write(
        &self,
        request: &WriteRequest,
        idempotency_key: &str,
        hash: Hash256,
    ) -> ExecutedWrite {
        // Settled between the caller's lookup and acquiring the slot
        match self
            .stores
            .log
            .idempotency_record(&request.tenant_id, &request.operation, idempotency_key)
            .await
        {
            Ok(Some(record)) => return (record.request_hash, Ok(record.into())),
            Ok(None) => {}
            Err(e) => return (hash, Err(e)),
        }

        let history = match self
            .stores
            .log
            .read_by_key(&request.tenant_id, &request.operation, idempotency_key)
            .await
        {
            Ok(history) => history,
            Err(e) => return (hash, Err(e)),
        };

        // A different payload already attempted under this key
        if history
            .iter()
            .filter_map(|entry| entry.request_hash)
            .any(|earlier| earlier != hash)
        {
            return (
                hash,
                Err(self.conflict(&request.operation, idempotency_key).await),
            );
        }

        if let Some(intent) = unsettled_intent(&history) {
            return (
                hash,
                Err(self
                    .in_doubt(&request.operation, idempotency_key, intent.id)
                    .await),
            );
        }

        (hash, self.execute_remote_write(request, idempotency_key, hash).await)
    }

    async fn in_doubt(&self, operation: &str, idempotency_key: &str, intent_log_id: i64) -> SyncError {
        self.metrics.inc_counter(metric_names::WRITES_IN_DOUBT).await;
        warn!(
            operation,
            idempotency_key,
            intent_log_id,
            "Write intent has no outcome, refusing to re-execute"
        );
        SyncError::WriteInDoubt {
            operation: operation.to_string(),
            key: idempotency_key.to_string(),
            intent_log_id,
        }
    }

    /// Settle an in-doubt write after checking the remote system by hand.
    ///
    /// `Applied` records the remote result as the key's OK outcome, so later
    /// calls replay it. `NotApplied` records a FAILED outcome, so the next
    /// call with the same payload executes again.
    #[instrument(skip(self, resolution), fields(tenant_id = %tenant_id, operation = %operation))]
    pub async fn resolve_in_doubt(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
        resolution: WriteResolution,
    ) -> Result<Option<WriteOutcome>> {
        let write_key = WriteKey {
            tenant_id: tenant_id.clone(),
            operation: operation.to_string(),
            idempotency_key: idempotency_key.to_string(),
        };
        if self.in_flight.contains(&write_key) {
            return Err(SyncError::InvariantViolation {
                invariant: "in_doubt_write".to_string(),
                message: format!("{operation}/{idempotency_key} is executing in this process"),
            });
        }

        let history = self
            .stores
            .log
            .read_by_key(tenant_id, operation, idempotency_key)
            .await?;
        let intent = unsettled_intent(&history).ok_or_else(|| SyncError::InvariantViolation {
            invariant: "in_doubt_write".to_string(),
            message: format!("{operation}/{idempotency_key} has no unsettled intent"),
        })?;
        let hash = intent.request_hash.ok_or_else(|| SyncError::InvariantViolation {
            invariant: "in_doubt_write".to_string(),
            message: format!("intent {} carries no request hash", intent.id),
        })?;

        let now = self.clock.now();
        match resolution {
            WriteResolution::Applied(response) => {
                let entry = self
                    .stores
                    .log
                    .append(
                        NewLogEntry::outcome(
                            tenant_id.clone(),
                            operation,
                            idempotency_key,
                            hash,
                            LogStatus::Ok,
                            now,
                        )
                        .payload(response.body.clone())
                        .source_version(response.source_version.clone()),
                    )
                    .await?;
                info!(idempotency_key, log_id = entry.id, "In-doubt write resolved as applied");
                Ok(Some(WriteOutcome {
                    log_id: entry.id,
                    idempotency_key: idempotency_key.to_string(),
                    payload: response.body,
                    source_version: response.source_version,
                }))
            }
            WriteResolution::NotApplied(reason) => {
                let entry = self
                    .stores
                    .log
                    .append(
                        NewLogEntry::outcome(
                            tenant_id.clone(),
                            operation,
                            idempotency_key,
                            hash,
                            LogStatus::Failed,
                            now,
                        )
                        .payload(intent.payload.clone())
                        .failed(FailureKind::Abandoned, format!("resolved as not applied: {reason}")),
                    )
                    .await?;
                info!(idempotency_key, log_id = entry.id, "In-doubt write resolved as not applied");
                Ok(None)
            }
        }
    }

    async fn execute_remote_write(
        &self,
        request: &WriteRequest,
        idempotency_key: &str,
        hash: Hash256,
    ) -> Result<WriteOutcome> {
        let target = request.target_key();
        let policy = match &target {
            Some(key) => self.policy_for(&key.entity_type),
            None => self.policies.current().default.clone(),
        };

        let mut intent = NewLogEntry::intent(
            request.tenant_id.clone(),
            &request.operation,
            idempotency_key,
            hash,
            self.clock.now(),
        )
        .payload(request.payload.clone());
        if let Some(key) = &target {
            intent = intent.entity(key);
        }
        let intent = self.stores.log.append(intent).await?;
        debug!(log_id = intent.id, idempotency_key, "Write intent recorded");

        let args = serde_json::json!({
            "tenant_id": request.tenant_id.0.to_string(),
            "idempotency_key": idempotency_key,
            "payload": request.payload,
        });
        let outcome = self
            .call_remote(&request.operation, &args, self.retries_for(&policy))
            .await;
        let now = self.clock.now();

        match outcome.result {
            Ok(response) => {
                let mut entry = NewLogEntry::outcome(
                    request.tenant_id.clone(),
                    &request.operation,
                    idempotency_key,
                    hash,
                    LogStatus::Ok,
                    now,
                )
                .payload(response.body.clone())
                .source_version(response.source_version.clone())
                .attempts(outcome.attempts);
                if let Some(key) = &target {
                    entry = entry.entity(key);
                }
                let entry = self.stores.log.append(entry).await?;

                if let Some(key) = &target {
                    self.upsert_provisional(key, request, &response, &entry).await?;
                }

                self.metrics.inc_counter(metric_names::WRITES_EXECUTED).await;
                info!(
                    idempotency_key,
                    log_id = entry.id,
                    attempts = outcome.attempts,
                    "Remote write succeeded"
                );
                Ok(WriteOutcome {
                    log_id: entry.id,
                    idempotency_key: idempotency_key.to_string(),
                    payload: response.body,
                    source_version: response.source_version,
                })
            }
            Err(err) => {
                let mut entry = NewLogEntry::outcome(
                    request.tenant_id.clone(),
                    &request.operation,
                    idempotency_key,
                    hash,
                    LogStatus::Failed,
                    now,
                )
                .payload(request.payload.clone())
                .attempts(outcome.attempts)
                .failed(err.kind(), err.to_string());
                if let Some(key) = &target {
                    entry = entry.entity(key);
                }
                self.stores.log.append(entry).await?;

                self.metrics.inc_counter(metric_names::WRITES_FAILED).await;
                warn!(
                    idempotency_key,
                    error = %err,
                    attempts = outcome.attempts,
                    "Remote write failed"
                );
                Err(match err {
                    RemoteError::Permanent(message) => SyncError::PermanentRemote {
                        operation: request.operation.clone(),
                        message,
                    },
                    other => SyncError::RetriesExhausted {
                        operation: request.operation.clone(),
                        kind: other.kind(),
                        attempts: outcome.attempts,
                        message: other.to_string(),
                    },
                })
            }
        }
    }

    /// Optimistic post-write mirror state, confirmed later by reconciliation
    async fn upsert_provisional(
        &self,
        key: &EntityKey,
        request: &WriteRequest,
        response: &RemotePayload,
        entry: &TransactionLogEntry,
    ) -> Result<()> {
        let existing = self.stores.mirror.get(key).await?;
        let fields = if response.body.is_null() {
            request.payload.clone()
        } else {
            response.body.clone()
        };
        self.stores
            .mirror
            .upsert(MirrorRecord {
                tenant_id: key.tenant_id.clone(),
                entity_type: key.entity_type.clone(),
                entity_id: key.entity_id.clone(),
                fields,
                source_version: response.source_version.clone(),
                last_synced_at: entry.created_at,
                provisional: true,
                drift_flagged: existing.map(|r| r.drift_flagged).unwrap_or(false),
                log_id: entry.id,
            })
            .await
    }

    // ------------------------------------------------------------------
    // State, drift and audit
    // ------------------------------------------------------------------

    /// Current synchronization state of one entity
    pub async fn entity_state(&self, key: &EntityKey) -> Result<SyncState> {
        let now = self.clock.now();
        if self.stores.leases.is_held(key, now).await? {
            return Ok(SyncState::Refreshing);
        }

        let policy = self.policy_for(&key.entity_type);
        let last_fetch_failed = self
            .stores
            .log
            .latest_fetch(key)
            .await?
            .is_some_and(|entry| entry.status == LogStatus::Failed);

        let Some(record) = self.stores.mirror.get(key).await? else {
            return Ok(if last_fetch_failed {
                SyncState::Degraded
            } else {
                SyncState::Stale
            });
        };

        let age = record.age(now);
        Ok(if within(age, policy.soft_ttl()) {
            SyncState::Fresh
        } else if last_fetch_failed && !within(age, policy.hard_ttl()) {
            SyncState::Degraded
        } else {
            SyncState::Stale
        })
    }

    /// Record reconciliation's verdict for a freshly refreshed entity.
    ///
    /// With drift, appends a `Drift` log entry and flags the mirror row;
    /// without, clears a previously set flag.
    pub(crate) async fn record_drift(
        &self,
        key: &EntityKey,
        previously_flagged: bool,
        drift: Vec<FieldDrift>,
    ) -> Result<Option<DriftEvent>> {
        if drift.is_empty() {
            if previously_flagged {
                self.stores.mirror.set_drift_flag(key, false).await?;
                info!(key = %key, "Drift flag cleared");
            }
            return Ok(None);
        }

        let now = self.clock.now();
        let policy = self.policy_for(&key.entity_type);
        let entry = self
            .stores
            .log
            .append(
                NewLogEntry::drift(key, policy.fetch_operation_for(&key.entity_type), now)
                    .payload(serde_json::to_value(&drift)?),
            )
            .await?;
        self.stores.mirror.set_drift_flag(key, true).await?;
        self.metrics.inc_counter(metric_names::RECONCILE_DRIFT).await;

        warn!(
            key = %key,
            log_id = entry.id,
            fields = ?drift.iter().map(|d| d.field.as_str()).collect::<Vec<_>>(),
            "Drift detected between mirror and remote"
        );
        Ok(Some(DriftEvent {
            key: key.clone(),
            fields: drift,
            log_id: entry.id,
            detected_at: now,
        }))
    }

    /// Log entries for one entity, oldest first
    pub async fn entity_history(&self, key: &EntityKey) -> Result<Vec<TransactionLogEntry>> {
        self.stores.log.read_entity(key).await
    }

    /// Every attempt recorded for one write key, oldest first
    pub async fn write_history(
        &self,
        tenant_id: &TenantId,
        operation: &str,
        idempotency_key: &str,
    ) -> Result<Vec<TransactionLogEntry>> {
        self.stores
            .log
            .read_by_key(tenant_id, operation, idempotency_key)
            .await
    }

    /// Tenant log entries after `after_id`, for incremental audit export
    pub async fn tenant_history(
        &self,
        tenant_id: &TenantId,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<TransactionLogEntry>> {
        self.stores.log.read_tenant(tenant_id, after_id, limit).await
    }
}
