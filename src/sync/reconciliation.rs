//! Reconciliation Scheduler
//!
//! Periodic STRICT sweep over mirror rows that are past their hard TTL,
//! drift flagged, or still provisional. Each candidate goes through the
//! orchestrator's normal `read_refresh` path; the refreshed value is then
//! compared against the prior mirror value to catch changes made outside
//! the product's write path.
//!
//! [`ReconciliationWorker`] drives passes on a timer for every known tenant
//! and accepts on-demand passes through its control channel.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{DriftEvent, FreshnessHint, MirrorRecord, TenantId};
use crate::infra::{Result, SyncError};
use crate::metrics::metric_names;

use super::drift::detect_drift;
use super::orchestrator::SyncOrchestrator;

/// Configuration for reconciliation passes and the background worker
#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    /// Run the background worker at all
    pub enabled: bool,
    /// Time between scheduled passes
    pub interval: Duration,
    /// Candidates refreshed concurrently within one pass
    pub concurrency: usize,
    /// Candidates examined per entity type per pass
    pub batch_size: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(86_400),
            concurrency: 4,
            batch_size: 500,
        }
    }
}

/// Outcome of one pass over one tenant
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub tenant_id: TenantId,
    /// Candidates selected across all entity types
    pub examined: usize,
    /// Candidates refreshed from the remote system
    pub refreshed: usize,
    /// Candidates whose refresh failed; their mirror is left as it was
    pub failed: usize,
    pub drift: Vec<DriftEvent>,
}

enum CandidateResult {
    Refreshed(Option<DriftEvent>),
    Failed,
}

/// Runs reconciliation passes against the orchestrator
#[derive(Clone)]
pub struct ReconciliationScheduler {
    orchestrator: Arc<SyncOrchestrator>,
    config: ReconciliationConfig,
}

impl ReconciliationScheduler {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, config: ReconciliationConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// Sweep one tenant: STRICT refresh of every candidate, then drift
    /// detection against the value it had before.
    ///
    /// A failed refresh is counted and skipped; it never fails the pass.
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn run_reconciliation_pass(&self, tenant_id: &TenantId) -> Result<ReconciliationReport> {
        let orchestrator = &self.orchestrator;
        let stores = orchestrator.stores();
        let metrics = orchestrator.metrics().clone();
        metrics.inc_counter(metric_names::RECONCILE_PASSES).await;

        let mut report = ReconciliationReport {
            tenant_id: tenant_id.clone(),
            ..ReconciliationReport::default()
        };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for entity_type in stores.mirror.entity_types(tenant_id).await? {
            let policy = orchestrator.policy_for(&entity_type);
            let hard_ttl = chrono::Duration::from_std(policy.hard_ttl())
                .map_err(|e| SyncError::Configuration(format!("hard_ttl out of range: {e}")))?;
            let cutoff = orchestrator
                .clock()
                .now()
                .checked_sub_signed(hard_ttl)
                .ok_or_else(|| {
                    SyncError::Configuration(format!(
                        "hard_ttl of {}s for {} reaches before the representable time range",
                        policy.hard_ttl_secs, entity_type
                    ))
                })?;

            let candidates = stores
                .mirror
                .reconciliation_candidates(tenant_id, &entity_type, cutoff, self.config.batch_size)
                .await?;
            debug!(
                entity_type = %entity_type,
                candidates = candidates.len(),
                "Selected reconciliation candidates"
            );
            report.examined += candidates.len();

            for prior in candidates {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| SyncError::Internal(e.to_string()))?;
                let orchestrator = Arc::clone(&self.orchestrator);
                tasks.spawn(async move {
                    let _permit = permit;
                    reconcile_one(&orchestrator, prior).await
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(CandidateResult::Refreshed(drift))) => {
                    report.refreshed += 1;
                    report.drift.extend(drift);
                }
                Ok(Ok(CandidateResult::Failed)) => report.failed += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "Reconciliation of candidate failed");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation task panicked");
                    report.failed += 1;
                }
            }
        }

        metrics
            .add_counter(metric_names::RECONCILE_EXAMINED, report.examined as u64)
            .await;
        metrics
            .add_counter(metric_names::RECONCILE_FAILED, report.failed as u64)
            .await;

        info!(
            examined = report.examined,
            refreshed = report.refreshed,
            failed = report.failed,
            drift = report.drift.len(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Passes for every tenant with mirrored data
    pub async fn run_all_tenants(&self) -> Result<Vec<ReconciliationReport>> {
        let mut reports = Vec::new();
        for tenant_id in self.orchestrator.stores().mirror.tenants().await? {
            match self.run_reconciliation_pass(&tenant_id).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(tenant_id = %tenant_id, error = %e, "Reconciliation pass failed"),
            }
        }
        Ok(reports)
    }
}

async fn reconcile_one(
    orchestrator: &SyncOrchestrator,
    prior: MirrorRecord,
) -> Result<CandidateResult> {
    let key = prior.key();
    let view = match orchestrator
        .read_refresh(
            &key.tenant_id,
            &key.entity_type,
            &key.entity_id,
            FreshnessHint::Strict,
        )
        .await
    {
        Ok(view) => view,
        Err(SyncError::NotAvailable { .. }) | Err(SyncError::LeaseContention { .. }) => {
            return Ok(CandidateResult::Failed)
        }
        Err(e) => return Err(e),
    };

    if view.stale {
        debug!(key = %key, last_error = ?view.last_error, "Candidate not refreshed");
        return Ok(CandidateResult::Failed);
    }

    let policy = orchestrator.policy_for(&key.entity_type);
    let drift = detect_drift(&prior.fields, view.fields(), &policy);
    let event = orchestrator
        .record_drift(&key, prior.drift_flagged, drift)
        .await?;
    Ok(CandidateResult::Refreshed(event))
}

/// Control messages for the reconciliation worker
#[derive(Debug)]
pub enum ReconcileMessage {
    /// Run a pass for one tenant now
    RunPass { tenant_id: TenantId },
    /// Stop the worker
    Shutdown,
}

/// Background task that runs reconciliation on a fixed interval
pub struct ReconciliationWorker {
    scheduler: ReconciliationScheduler,
    control_tx: mpsc::Sender<ReconcileMessage>,
    control_rx: mpsc::Receiver<ReconcileMessage>,
}

impl ReconciliationWorker {
    pub fn new(scheduler: ReconciliationScheduler) -> Self {
        let (control_tx, control_rx) = mpsc::channel(16);
        Self {
            scheduler,
            control_tx,
            control_rx,
        }
    }

    /// Sender for on-demand passes and shutdown
    pub fn control_handle(&self) -> mpsc::Sender<ReconcileMessage> {
        self.control_tx.clone()
    }

    /// Run until `Shutdown` is received or every control handle is dropped
    pub async fn run(mut self) {
        let config = self.scheduler.config().clone();
        if !config.enabled {
            info!("Reconciliation worker disabled");
            return;
        }

        info!(
            interval_secs = config.interval.as_secs(),
            concurrency = config.concurrency,
            "Starting reconciliation worker"
        );

        let mut ticker = interval(config.interval);
        // The first tick completes immediately; skip it so startup is quiet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scheduler.run_all_tenants().await {
                        error!(error = %e, "Scheduled reconciliation failed");
                    }
                }
                msg = self.control_rx.recv() => {
                    match msg {
                        Some(ReconcileMessage::RunPass { tenant_id }) => {
                            info!(tenant_id = %tenant_id, "Running requested reconciliation pass");
                            if let Err(e) = self.scheduler.run_reconciliation_pass(&tenant_id).await {
                                error!(tenant_id = %tenant_id, error = %e, "Requested reconciliation failed");
                            }
                        }
                        Some(ReconcileMessage::Shutdown) | None => {
                            info!("Reconciliation worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}
