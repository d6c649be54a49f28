//! Infrastructure layer for the ledger synchronization core
//!
//! Contains trait definitions and implementations for:
//! - Transaction log (append-only audit trail)
//! - Mirror store (latest known-good entity copies)
//! - Refresh leases (per-entity mutual exclusion)
//! - Remote adapter seam
//! - Retry with backoff, and the clock abstraction

mod clock;
mod error;
mod memory;
mod retry;
pub mod sqlite;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::*;
pub use memory::{InMemoryLeaseStore, InMemoryMirrorStore, InMemoryTransactionLog};
pub use retry::{Retry, RetryConfig, RetryDirective, RetryResult};
pub use sqlite::{SqliteLeaseStore, SqliteMirrorStore, SqliteTransactionLog};
pub use traits::*;
