//! Synchronization core
//!
//! - [`SyncOrchestrator`] - freshness-aware reads and idempotent writes
//! - [`detect_drift`] - significant-field comparison used by reconciliation
//! - [`ReconciliationScheduler`] / [`ReconciliationWorker`] - periodic STRICT sweeps

mod drift;
mod idempotency;
mod orchestrator;
mod reconciliation;

pub use drift::{detect_drift, relative_delta};
pub use idempotency::{WriteOutcome, WriteRequest, WriteResolution};
pub use orchestrator::{OrchestratorConfig, SyncOrchestrator, SyncStores};
pub use reconciliation::{
    ReconcileMessage, ReconciliationConfig, ReconciliationReport, ReconciliationScheduler,
    ReconciliationWorker,
};
