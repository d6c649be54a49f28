//! Core type definitions for the ledger synchronization core
//!
//! Identifiers, closed enums for log direction/status and freshness hints,
//! and the composite key every mirror row and lease is addressed by.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte hash (SHA-256)
pub type Hash256 = [u8; 32];

/// Serde module for serializing Hash256 as hex strings
pub mod hash256_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash256"))
    }
}

/// Serde module for optional Hash256 as hex strings
pub mod option_hash256_hex {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(opt: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match opt {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash256"))?;
                Ok(Some(arr))
            }
            None => Ok(None),
        }
    }
}

/// Tenant identifier (organization/account level)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub uuid::Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entity type classification for remote accounting entities
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(pub String);

impl EntityType {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self(entity_type.into())
    }

    pub fn bill() -> Self {
        Self("bill".to_string())
    }

    pub fn invoice() -> Self {
        Self("invoice".to_string())
    }

    pub fn balance() -> Self {
        Self("balance".to_string())
    }

    pub fn payment() -> Self {
        Self("payment".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Addresses one mirrored remote entity within a tenant.
///
/// Every mirror row and every refresh lease is keyed by this triple, so two
/// tenants never share cache state for the same remote id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(
        tenant_id: TenantId,
        entity_type: EntityType,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.entity_type, self.entity_id)
    }
}

/// Caller preference for how fresh a read must be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FreshnessHint {
    /// Always consult the remote system
    Strict,
    /// Accept the mirror while it is inside the soft TTL
    CachedOk,
}

/// Direction of an exchange with the remote system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Facts read from the remote system
    Inbound,
    /// Intents and results of writes to the remote system
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// Outcome recorded on a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Ok,
    /// Pre-execution intent, or an attempt whose outcome is still pending
    Retry,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Ok => "ok",
            LogStatus::Retry => "retry",
            LogStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(LogStatus::Ok),
            "retry" => Some(LogStatus::Retry),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }
}

/// What a log entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Result of a read against the remote system
    Fetch,
    /// Write intent recorded before the remote call
    Intent,
    /// Terminal result of a write
    Outcome,
    /// Reconciliation found the mirror had drifted from the remote value
    Drift,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Fetch => "fetch",
            LogKind::Intent => "intent",
            LogKind::Outcome => "outcome",
            LogKind::Drift => "drift",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch" => Some(LogKind::Fetch),
            "intent" => Some(LogKind::Intent),
            "outcome" => Some(LogKind::Outcome),
            "drift" => Some(LogKind::Drift),
            _ => None,
        }
    }
}

/// Failure classification carried in logs and hygiene annotations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    RateLimited,
    Permanent,
    Timeout,
    LeaseContention,
    /// An interrupted write an operator confirmed never reached the remote
    Abandoned,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Permanent => "permanent",
            FailureKind::Timeout => "timeout",
            FailureKind::LeaseContention => "lease_contention",
            FailureKind::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(FailureKind::Transient),
            "rate_limited" => Some(FailureKind::RateLimited),
            "permanent" => Some(FailureKind::Permanent),
            "timeout" => Some(FailureKind::Timeout),
            "lease_contention" => Some(FailureKind::LeaseContention),
            "abandoned" => Some(FailureKind::Abandoned),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity synchronization state
///
/// `Degraded` is not terminal; the next successful refresh returns to `Fresh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Fresh,
    Stale,
    Refreshing,
    Degraded,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Fresh => write!(f, "FRESH"),
            SyncState::Stale => write!(f, "STALE"),
            SyncState::Refreshing => write!(f, "REFRESHING"),
            SyncState::Degraded => write!(f, "DEGRADED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_strings() {
        for status in [LogStatus::Ok, LogStatus::Retry, LogStatus::Failed] {
            assert_eq!(LogStatus::parse(status.as_str()), Some(status));
        }
        for kind in [LogKind::Fetch, LogKind::Intent, LogKind::Outcome, LogKind::Drift] {
            assert_eq!(LogKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(LogStatus::parse("OK"), None);
    }

    #[test]
    fn test_freshness_hint_wire_names() {
        assert_eq!(
            serde_json::to_string(&FreshnessHint::CachedOk).unwrap(),
            "\"CACHED_OK\""
        );
        assert_eq!(
            serde_json::to_string(&FreshnessHint::Strict).unwrap(),
            "\"STRICT\""
        );
    }

    #[test]
    fn test_entity_key_is_tenant_scoped() {
        let a = EntityKey::new(TenantId::new(), EntityType::bill(), "bill-1");
        let b = EntityKey::new(TenantId::new(), EntityType::bill(), "bill-1");
        assert_ne!(a, b);
        assert!(a.to_string().ends_with("/bill/bill-1"));
    }
}
