//! Integration tests against the SQLite backend
//!
//! Same orchestrator flows as the in-memory tests, plus durability checks:
//! a completed write is still replayed by a fresh orchestrator on the same
//! database, and the log's append-only guarantees hold at the SQL level.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use stateset_ledger_sync::config::PolicyHandle;
use stateset_ledger_sync::domain::{
    EntityType, FreshnessHint, LogStatus, NewLogEntry, PolicySet, SyncPolicy,
};
use stateset_ledger_sync::infra::sqlite::{self, SqliteMirrorStore};
use stateset_ledger_sync::infra::{Clock, ManualClock};
use stateset_ledger_sync::sync::{ReconciliationConfig, ReconciliationScheduler};
use stateset_ledger_sync::{RemotePayload, SyncError, SyncOrchestrator, SyncStores};

async fn memory_pool() -> sqlx::SqlitePool {
    sqlite::connect("sqlite::memory:", 1).await.unwrap()
}

fn orchestrator_on(pool: &sqlx::SqlitePool, remote: Arc<ScriptedRemote>) -> SyncOrchestrator {
    SyncOrchestrator::new(
        SyncStores::sqlite(pool.clone()),
        remote,
        PolicyHandle::default(),
        test_config(),
    )
    .with_clock(Arc::new(ManualClock::new(t0())))
}

#[tokio::test]
async fn test_read_refresh_persists_log_and_mirror() {
    let h = Harness::sqlite().await;
    let key = bill_key("sql-bill-1");
    h.remote.always(
        "get_bill",
        Ok(RemotePayload::new(bill_payload(99.5, "open")).with_version("etag-1")),
    );

    let view = h
        .orchestrator
        .read_refresh(&key.tenant_id, &key.entity_type, &key.entity_id, FreshnessHint::CachedOk)
        .await
        .unwrap();
    assert!(!view.stale);

    let stored = h.stores.mirror.get(&key).await.unwrap().unwrap();
    assert_eq!(stored, view.record);
    assert_eq!(stored.last_synced_at, t0());

    // Second read inside the soft TTL is served from SQLite
    h.clock.advance(Duration::from_secs(60));
    let cached = h
        .orchestrator
        .read_refresh(&key.tenant_id, &key.entity_type, &key.entity_id, FreshnessHint::CachedOk)
        .await
        .unwrap();
    assert_eq!(cached.record, stored);
    assert_eq!(h.remote.call_count("get_bill"), 1);

    let history = h.orchestrator.entity_history(&key).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].payload["amount"], 99.5);
    assert_eq!(history[0].source_version.as_deref(), Some("etag-1"));
}

#[tokio::test]
async fn test_completed_write_survives_restart() {
    let pool = memory_pool().await;
    let tenant = test_tenant_id();
    let payload = payment_payload("bill-9", 640.0);

    let first_remote = Arc::new(ScriptedRemote::new());
    first_remote.always(
        "create_payment",
        Ok(RemotePayload::new(json!({"payment_id": "pay-sql"}))),
    );
    let first = orchestrator_on(&pool, first_remote.clone())
        .write_idempotent(&tenant, "create_payment", Some("restart-key".into()), payload.clone())
        .await
        .unwrap();

    // A new process with a remote that would fail if called
    let second_remote = Arc::new(ScriptedRemote::new());
    let replayed = orchestrator_on(&pool, second_remote.clone())
        .write_idempotent(&tenant, "create_payment", Some("restart-key".into()), payload)
        .await
        .unwrap();

    assert_eq!(first, replayed);
    assert_eq!(first_remote.total_calls(), 1);
    assert_eq!(second_remote.total_calls(), 0);
}

#[tokio::test]
async fn test_conflict_detected_from_persisted_record() {
    let pool = memory_pool().await;
    let tenant = test_tenant_id();
    let remote = Arc::new(ScriptedRemote::new());
    remote.always("create_payment", Ok(RemotePayload::new(json!({"ok": true}))));

    orchestrator_on(&pool, remote.clone())
        .write_idempotent(&tenant, "create_payment", Some("k".into()), json!({"amount": 1}))
        .await
        .unwrap();
    let err = orchestrator_on(&pool, remote.clone())
        .write_idempotent(&tenant, "create_payment", Some("k".into()), json!({"amount": 2}))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::IdempotencyConflict { .. }));
    assert_eq!(remote.total_calls(), 1);
}

#[tokio::test]
async fn test_second_ok_outcome_rejected_by_schema() {
    let h = Harness::sqlite().await;
    let tenant = test_tenant_id();
    let ok = |at| {
        NewLogEntry::outcome(
            tenant.clone(),
            "create_payment",
            "dup-key",
            [3u8; 32],
            LogStatus::Ok,
            at,
        )
    };

    h.stores.log.append(ok(t0())).await.unwrap();
    let err = h.stores.log.append(ok(t0())).await.unwrap_err();
    assert!(matches!(err, SyncError::InvariantViolation { .. }));

    // FAILED outcomes for the same key are allowed alongside
    h.stores
        .log
        .append(NewLogEntry::outcome(
            tenant.clone(),
            "create_payment",
            "dup-key",
            [3u8; 32],
            LogStatus::Failed,
            t0(),
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reconciliation_on_sqlite_flags_drift() {
    let policies = PolicySet::new(SyncPolicy::default()).with_policy(
        EntityType::balance(),
        SyncPolicy::default().with_drift(0.10, &["balance"]),
    );
    let pool = memory_pool().await;
    let h = Harness::build(SyncStores::sqlite(pool.clone()), policies, test_config());
    let key = stateset_ledger_sync::EntityKey::new(test_tenant_id(), EntityType::balance(), "op");
    h.seed_mirror(mirror_record(&key, json!({"balance": "1000.00"}), t0()))
        .await;
    h.remote
        .always("get_balance", Ok(RemotePayload::new(json!({"balance": "1300.00"}))));

    h.clock.advance(Duration::from_secs(2 * 86_400));
    let report = ReconciliationScheduler::new(h.orchestrator.clone(), ReconciliationConfig::default())
        .run_reconciliation_pass(&test_tenant_id())
        .await
        .unwrap();
    assert_eq!(report.drift.len(), 1);

    let stale = SqliteMirrorStore::new(pool)
        .list_stale(&test_tenant_id(), h.clock.now() - chrono::Duration::days(1), 10)
        .await
        .unwrap();
    assert!(stale.is_empty());
    let record = h.stores.mirror.get(&key).await.unwrap().unwrap();
    assert!(record.drift_flagged);
    assert_eq!(record.fields["balance"], "1300.00");
}

#[tokio::test]
async fn test_purge_tenant_leaves_log_intact() {
    let h = Harness::sqlite().await;
    let key = bill_key("purge-1");
    h.remote
        .always("get_bill", Ok(RemotePayload::new(bill_payload(1.0, "open"))));
    h.orchestrator
        .read_refresh(&key.tenant_id, &key.entity_type, &key.entity_id, FreshnessHint::Strict)
        .await
        .unwrap();

    let removed = h.stores.mirror.purge_tenant(&key.tenant_id).await.unwrap();
    assert_eq!(removed, 1);
    assert!(h.stores.mirror.get(&key).await.unwrap().is_none());
    assert_eq!(h.orchestrator.entity_history(&key).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_log_entries_read_back_in_append_order() {
    let h = Harness::sqlite().await;
    let tenant = test_tenant_id();
    h.remote
        .always("create_payment", Ok(RemotePayload::new(json!({"ok": 1}))));
    for i in 0..3 {
        h.orchestrator
            .write_idempotent(&tenant, "create_payment", Some(format!("ord-{i}")), json!({"n": i}))
            .await
            .unwrap();
    }

    let all = h.stores.log.read_tenant(&tenant, 0, 100).await.unwrap();
    assert_eq!(all.len(), 6);
    assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    assert!(all.windows(2).all(|w| w[0].created_at <= w[1].created_at));
}
