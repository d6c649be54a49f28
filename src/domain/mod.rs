//! Domain models for the ledger synchronization core
//!
//! Plain data: identifiers, transaction log entries, mirror records and
//! views, and per-entity-type policies. No I/O lives here.

mod log;
mod mirror;
mod policy;
mod types;

pub use log::*;
pub use mirror::*;
pub use policy::*;
pub use types::*;
