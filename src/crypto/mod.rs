//! Hashing utilities for the ledger synchronization core
//!
//! Provides canonical JSON hashing for write request fingerprints and
//! derived idempotency keys.

mod hash;

pub use hash::*;
