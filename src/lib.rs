//! StateSet Ledger Sync Library
//!
//! Synchronization core that mirrors entities from an external accounting
//! system, executes remote writes at most once per idempotency key, and
//! records every exchange in an append-only transaction log.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (log entries, mirror records, policies)
//! - [`infra`] - Storage and remote seams, retry, clock (in-memory, SQLite)
//! - [`sync`] - Sync Orchestrator and Reconciliation Scheduler
//! - [`crypto`] - Canonical request hashing and idempotency key derivation
//! - [`config`] - Environment configuration and policy loading
//! - [`metrics`] - Counters and latency histograms
//! - [`telemetry`] - Structured logging setup

pub mod config;
pub mod crypto;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod sync;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    EntityKey, EntityType, FreshnessHint, MirrorRecord, MirrorView, PolicySet, SyncPolicy,
    SyncState, TenantId, TransactionLogEntry,
};

pub use infra::{RemoteAdapter, RemoteError, RemotePayload, Result, SyncError};

pub use sync::{
    OrchestratorConfig, ReconciliationScheduler, SyncOrchestrator, SyncStores, WriteOutcome,
    WriteRequest, WriteResolution,
};
