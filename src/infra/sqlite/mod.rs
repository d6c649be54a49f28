//! SQLite implementations of the synchronization stores
//!
//! One database file holds the transaction log, the mirror and the refresh
//! leases. The schema lives in `migrations/sqlite` and is applied with
//! [`crate::migrations::run_sqlite`].

mod lease;
mod log;
mod mirror;

pub use lease::SqliteLeaseStore;
pub use log::SqliteTransactionLog;
pub use mirror::SqliteMirrorStore;

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::domain::TenantId;
use crate::infra::{Result, SyncError};

/// Open (creating if needed) a database and apply pending migrations
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    crate::migrations::run_sqlite(&pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;
    Ok(pool)
}

/// Fixed-width UTC timestamp so string order matches time order
pub(crate) fn encode_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Serialization(format!("invalid timestamp '{}': {}", raw, e)))
}

pub(crate) fn decode_tenant(raw: &str) -> Result<TenantId> {
    uuid::Uuid::parse_str(raw)
        .map(TenantId::from_uuid)
        .map_err(|e| SyncError::Serialization(format!("invalid tenant id '{}': {}", raw, e)))
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::migrations::run_sqlite(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let b = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(encode_ts(a) < encode_ts(b));
        assert_eq!(encode_ts(b), "2026-01-10T00:00:00.000000Z");
        assert_eq!(decode_ts(&encode_ts(a)).unwrap(), a);
    }
}
