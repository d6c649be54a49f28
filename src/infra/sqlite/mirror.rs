//! SQLite mirror store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, FromRow};

use crate::domain::{EntityKey, EntityType, MirrorRecord, TenantId};
use crate::infra::{MirrorStore, Result, SyncError};

use super::{decode_tenant, decode_ts, encode_ts};

/// SQLite-backed mirror, one row per `(tenant, type, id)`
#[derive(Clone)]
pub struct SqliteMirrorStore {
    pool: SqlitePool,
}

impl SqliteMirrorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Rows last synced before `synced_before`, oldest first
    pub async fn list_stale(
        &self,
        tenant_id: &TenantId,
        synced_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MirrorRecord>> {
        let rows = sqlx::query_as::<_, MirrorRow>(
            r#"
            SELECT tenant_id, entity_type, entity_id, fields, source_version,
                   last_synced_at, provisional, drift_flagged, log_id
            FROM mirror_records
            WHERE tenant_id = ? AND last_synced_at < ?
            ORDER BY last_synced_at ASC, entity_type ASC, entity_id ASC
            LIMIT ?
            "#,
        )
        .bind(tenant_id.0.to_string())
        .bind(encode_ts(synced_before))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MirrorRecord::try_from).collect()
    }
}

#[async_trait]
impl MirrorStore for SqliteMirrorStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<MirrorRecord>> {
        let row = sqlx::query_as::<_, MirrorRow>(
            r#"
            SELECT tenant_id, entity_type, entity_id, fields, source_version,
                   last_synced_at, provisional, drift_flagged, log_id
            FROM mirror_records
            WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(key.tenant_id.0.to_string())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MirrorRecord::try_from).transpose()
    }

    async fn upsert(&self, record: MirrorRecord) -> Result<()> {
        let fields_json = serde_json::to_string(&record.fields)?;

        sqlx::query(
            r#"
            INSERT INTO mirror_records (
                tenant_id, entity_type, entity_id, fields, source_version,
                last_synced_at, provisional, drift_flagged, log_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tenant_id, entity_type, entity_id) DO UPDATE SET
                fields = excluded.fields,
                source_version = excluded.source_version,
                last_synced_at = excluded.last_synced_at,
                provisional = excluded.provisional,
                drift_flagged = excluded.drift_flagged,
                log_id = excluded.log_id
            "#,
        )
        .bind(record.tenant_id.0.to_string())
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(&fields_json)
        .bind(&record.source_version)
        .bind(encode_ts(record.last_synced_at))
        .bind(record.provisional as i64)
        .bind(record.drift_flagged as i64)
        .bind(record.log_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_drift_flag(&self, key: &EntityKey, flagged: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE mirror_records SET drift_flagged = ?
            WHERE tenant_id = ? AND entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(flagged as i64)
        .bind(key.tenant_id.0.to_string())
        .bind(key.entity_type.as_str())
        .bind(&key.entity_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reconciliation_candidates(
        &self,
        tenant_id: &TenantId,
        entity_type: &EntityType,
        synced_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MirrorRecord>> {
        let rows = sqlx::query_as::<_, MirrorRow>(
            r#"
            SELECT tenant_id, entity_type, entity_id, fields, source_version,
                   last_synced_at, provisional, drift_flagged, log_id
            FROM mirror_records
            WHERE tenant_id = ? AND entity_type = ?
              AND (last_synced_at < ? OR drift_flagged = 1 OR provisional = 1)
            ORDER BY last_synced_at ASC, entity_id ASC
            LIMIT ?
            "#,
        )
        .bind(tenant_id.0.to_string())
        .bind(entity_type.as_str())
        .bind(encode_ts(synced_before))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MirrorRecord::try_from).collect()
    }

    async fn entity_types(&self, tenant_id: &TenantId) -> Result<Vec<EntityType>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT entity_type FROM mirror_records WHERE tenant_id = ? ORDER BY entity_type",
        )
        .bind(tenant_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(t,)| EntityType::from(t)).collect())
    }

    async fn tenants(&self) -> Result<Vec<TenantId>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT tenant_id FROM mirror_records ORDER BY tenant_id")
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(|(t,)| decode_tenant(t)).collect()
    }

    async fn purge_tenant(&self, tenant_id: &TenantId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mirror_records WHERE tenant_id = ?")
            .bind(tenant_id.0.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, FromRow)]
struct MirrorRow {
    tenant_id: String,
    entity_type: String,
    entity_id: String,
    fields: String,
    source_version: Option<String>,
    last_synced_at: String,
    provisional: i64,
    drift_flagged: i64,
    log_id: i64,
}

impl TryFrom<MirrorRow> for MirrorRecord {
    type Error = SyncError;

    fn try_from(row: MirrorRow) -> Result<Self> {
        Ok(MirrorRecord {
            tenant_id: decode_tenant(&row.tenant_id)?,
            entity_type: EntityType::from(row.entity_type),
            entity_id: row.entity_id,
            fields: serde_json::from_str(&row.fields)?,
            source_version: row.source_version,
            last_synced_at: decode_ts(&row.last_synced_at)?,
            provisional: row.provisional != 0,
            drift_flagged: row.drift_flagged != 0,
            log_id: row.log_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::test_pool;
    use chrono::TimeZone;

    fn record(tenant: &TenantId, id: &str, synced: DateTime<Utc>) -> MirrorRecord {
        MirrorRecord {
            tenant_id: tenant.clone(),
            entity_type: EntityType::bill(),
            entity_id: id.to_string(),
            fields: serde_json::json!({"amount": 125.5, "vendor": "Acme"}),
            source_version: Some("v1".to_string()),
            last_synced_at: synced,
            provisional: false,
            drift_flagged: false,
            log_id: 1,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_row() {
        let store = SqliteMirrorStore::new(test_pool().await);
        let tenant = TenantId::new();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let mut rec = record(&tenant, "bill-1", t0);
        store.upsert(rec.clone()).await.unwrap();
        rec.fields = serde_json::json!({"amount": 130.0});
        rec.log_id = 2;
        store.upsert(rec.clone()).await.unwrap();

        assert_eq!(store.get(&rec.key()).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn test_reconciliation_candidates() {
        let store = SqliteMirrorStore::new(test_pool().await);
        let tenant = TenantId::new();
        let old = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let recent = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let cutoff = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();

        store.upsert(record(&tenant, "old", old)).await.unwrap();
        store.upsert(record(&tenant, "recent", recent)).await.unwrap();
        let mut flagged = record(&tenant, "flagged", recent);
        flagged.drift_flagged = true;
        store.upsert(flagged).await.unwrap();
        let mut provisional = record(&tenant, "provisional", recent);
        provisional.provisional = true;
        store.upsert(provisional).await.unwrap();

        let ids: Vec<String> = store
            .reconciliation_candidates(&tenant, &EntityType::bill(), cutoff, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.entity_id)
            .collect();
        assert_eq!(ids, vec!["old", "flagged", "provisional"]);

        let stale = store.list_stale(&tenant, cutoff, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn test_drift_flag_and_purge() {
        let store = SqliteMirrorStore::new(test_pool().await);
        let tenant = TenantId::new();
        let rec = record(&tenant, "bill-1", Utc::now());
        store.upsert(rec.clone()).await.unwrap();

        store.set_drift_flag(&rec.key(), true).await.unwrap();
        assert!(store.get(&rec.key()).await.unwrap().unwrap().drift_flagged);
        assert_eq!(store.tenants().await.unwrap(), vec![tenant.clone()]);
        assert_eq!(store.entity_types(&tenant).await.unwrap(), vec![EntityType::bill()]);

        assert_eq!(store.purge_tenant(&tenant).await.unwrap(), 1);
        assert!(store.get(&rec.key()).await.unwrap().is_none());
    }
}
