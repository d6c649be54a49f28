//! Mirror records and the views returned to readers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EntityKey, EntityType, FailureKind, SyncState, TenantId};

/// Latest known-good local copy of one remote entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Denormalized current view of the remote entity
    pub fields: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    /// Set by an optimistic post-write upsert until a refresh confirms it
    pub provisional: bool,
    /// Set when reconciliation observed drift; cleared by a drift-free pass
    pub drift_flagged: bool,
    /// Log entry that produced this version of the row
    pub log_id: i64,
}

impl MirrorRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(
            self.tenant_id.clone(),
            self.entity_type.clone(),
            self.entity_id.clone(),
        )
    }

    /// Age of the row at `now`, clamped at zero
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_synced_at).max(chrono::Duration::zero())
    }
}

/// What a reader gets back: the mirror plus its hygiene annotation.
///
/// A stale view is still a successful response; `stale` and `last_error`
/// tell the product layer to show it with a freshness warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorView {
    pub record: MirrorRecord,
    pub state: SyncState,
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureKind>,
}

impl MirrorView {
    pub fn fresh(record: MirrorRecord) -> Self {
        Self {
            record,
            state: SyncState::Fresh,
            stale: false,
            last_error: None,
        }
    }

    /// Annotate a record that could not be refreshed
    pub fn degraded(record: MirrorRecord, last_error: FailureKind, past_hard_ttl: bool) -> Self {
        Self {
            record,
            state: if past_hard_ttl {
                SyncState::Degraded
            } else {
                SyncState::Stale
            },
            stale: true,
            last_error: Some(last_error),
        }
    }

    pub fn fields(&self) -> &serde_json::Value {
        &self.record.fields
    }
}

/// A significant field whose authoritative value moved beyond the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDrift {
    pub field: String,
    pub previous: f64,
    pub current: f64,
    /// `|current - previous| / |previous|`; infinite when previous is zero
    pub relative_delta: f64,
}

/// Drift detected for one entity during a reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvent {
    pub key: EntityKey,
    pub fields: Vec<FieldDrift>,
    /// The `Drift` log entry recording this event
    pub log_id: i64,
    pub detected_at: DateTime<Utc>,
}
