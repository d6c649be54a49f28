//! SQLite refresh leases
//!
//! Acquisition is a single upsert that only overwrites an expired row, so
//! two workers sharing the database cannot both win.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use uuid::Uuid;

use crate::domain::EntityKey;
use crate::infra::{Lease, LeaseStore, Result, SyncError};

use super::encode_ts;

#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(
        &self,
        key: &EntityKey,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SyncError::Configuration(format!("lease ttl out of range: {}", e)))?;
        let holder = Uuid::new_v4();
        let expires_at = now + ttl;

        let result = sqlx::query(
            r#"
            INSERT INTO refresh_leases (tenant_id, entity_type, entity_id, holder, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, entity_type, entity_id) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE refresh_leases.expires_at <= ?
            "#,
        )
        .bind(key.tenant_id.0.to_string())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_id)
        .bind(holder.to_string())
        .bind(encode_ts(expires_at))
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Lease {
            key: key.clone(),
            holder,
            expires_at,
        }))
    }

    async fn renew(
        &self,
        lease: &Lease,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SyncError::Configuration(format!("lease ttl out of range: {}", e)))?;
        let expires_at = now + ttl;

        let result = sqlx::query(
            r#"
            UPDATE refresh_leases SET expires_at = ?
            WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? AND holder = ?
            "#,
        )
        .bind(encode_ts(expires_at))
        .bind(lease.key.tenant_id.0.to_string())
        .bind(lease.key.entity_type.as_str())
        .bind(&lease.key.entity_id)
        .bind(lease.holder.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(Lease {
            expires_at,
            ..lease.clone()
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM refresh_leases
            WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? AND holder = ?
            "#,
        )
        .bind(lease.key.tenant_id.0.to_string())
        .bind(lease.key.entity_type.as_str())
        .bind(&lease.key.entity_id)
        .bind(lease.holder.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_held(&self, key: &EntityKey, now: DateTime<Utc>) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM refresh_leases
            WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? AND expires_at > ?
            "#,
        )
        .bind(key.tenant_id.0.to_string())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_id)
        .bind(encode_ts(now))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }
}
