//! Per-entity-type synchronization policy
//!
//! Policies are configuration: loaded at startup from JSON, optionally
//! replaced at runtime, and only ever read by the orchestrator.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::EntityType;

/// Default soft TTL: mirror rows younger than this satisfy `CACHED_OK` reads
pub const DEFAULT_SOFT_TTL_SECS: u64 = 900;

/// Default hard TTL: rows older than this are flagged degraded when stale
pub const DEFAULT_HARD_TTL_SECS: u64 = 86_400;

/// Default number of additional remote attempts after the first
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 2;

/// Upper bound accepted for either TTL (ten years)
pub const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

/// Default relative change that reconciliation treats as drift
pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.10;

fn default_retry_enabled() -> bool {
    true
}

fn default_drift_threshold() -> f64 {
    DEFAULT_DRIFT_THRESHOLD
}

/// Freshness, retry and drift settings for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub soft_ttl_secs: u64,
    pub hard_ttl_secs: u64,
    /// Additional attempts after the first; 0 disables retries
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_enabled")]
    pub retry_enabled: bool,
    /// Remote operation used to fetch one entity; defaults to `get_<entity_type>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_operation: Option<String>,
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// Numeric fields compared by reconciliation; empty compares every
    /// top-level numeric field present on both sides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drift_fields: Vec<String>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            soft_ttl_secs: DEFAULT_SOFT_TTL_SECS,
            hard_ttl_secs: DEFAULT_HARD_TTL_SECS,
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_enabled: true,
            fetch_operation: None,
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            drift_fields: Vec::new(),
        }
    }
}

impl SyncPolicy {
    pub fn soft_ttl(&self) -> Duration {
        Duration::from_secs(self.soft_ttl_secs)
    }

    pub fn hard_ttl(&self) -> Duration {
        Duration::from_secs(self.hard_ttl_secs)
    }

    /// Retries actually granted, honoring the per-type toggle
    pub fn effective_retries(&self) -> u32 {
        if self.retry_enabled {
            self.max_retry_attempts
        } else {
            0
        }
    }

    pub fn fetch_operation_for(&self, entity_type: &EntityType) -> String {
        self.fetch_operation
            .clone()
            .unwrap_or_else(|| format!("get_{}", entity_type.as_str()))
    }

    pub fn with_soft_ttl_secs(mut self, secs: u64) -> Self {
        self.soft_ttl_secs = secs;
        self
    }

    pub fn with_hard_ttl_secs(mut self, secs: u64) -> Self {
        self.hard_ttl_secs = secs;
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn with_drift(mut self, threshold: f64, fields: &[&str]) -> Self {
        self.drift_threshold = threshold;
        self.drift_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// All configured policies, with a fallback for unlisted entity types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub default: SyncPolicy,
    #[serde(default)]
    pub entity_types: HashMap<String, SyncPolicy>,
}

impl PolicySet {
    pub fn new(default: SyncPolicy) -> Self {
        Self {
            default,
            entity_types: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, entity_type: EntityType, policy: SyncPolicy) -> Self {
        self.entity_types.insert(entity_type.0, policy);
        self
    }

    pub fn policy_for(&self, entity_type: &EntityType) -> &SyncPolicy {
        self.entity_types
            .get(entity_type.as_str())
            .unwrap_or(&self.default)
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self) -> Result<(), String> {
        let all = std::iter::once(("default", &self.default)).chain(
            self.entity_types
                .iter()
                .map(|(name, policy)| (name.as_str(), policy)),
        );
        for (name, policy) in all {
            if policy.hard_ttl_secs > MAX_TTL_SECS {
                return Err(format!(
                    "policy '{}': hard_ttl_secs ({}) exceeds the maximum of {}",
                    name, policy.hard_ttl_secs, MAX_TTL_SECS
                ));
            }
            if policy.hard_ttl_secs < policy.soft_ttl_secs {
                return Err(format!(
                    "policy '{}': hard_ttl_secs ({}) must be >= soft_ttl_secs ({})",
                    name, policy.hard_ttl_secs, policy.soft_ttl_secs
                ));
            }
            if !(policy.drift_threshold.is_finite() && policy.drift_threshold >= 0.0) {
                return Err(format!(
                    "policy '{}': drift_threshold must be a non-negative number",
                    name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_set_parses_with_defaults() {
        let json = r#"{
            "default": { "soft_ttl_secs": 600, "hard_ttl_secs": 7200, "max_retry_attempts": 1 },
            "entity_types": {
                "balance": {
                    "soft_ttl_secs": 60,
                    "hard_ttl_secs": 3600,
                    "max_retry_attempts": 3,
                    "drift_threshold": 0.05,
                    "drift_fields": ["balance"]
                }
            }
        }"#;
        let set: PolicySet = serde_json::from_str(json).unwrap();
        set.validate().unwrap();

        let bill = set.policy_for(&EntityType::bill());
        assert_eq!(bill.soft_ttl_secs, 600);
        assert!(bill.retry_enabled);
        assert_eq!(bill.drift_threshold, DEFAULT_DRIFT_THRESHOLD);

        let balance = set.policy_for(&EntityType::balance());
        assert_eq!(balance.max_retry_attempts, 3);
        assert_eq!(balance.drift_fields, vec!["balance".to_string()]);
    }

    #[test]
    fn test_retry_toggle_zeroes_attempts() {
        let policy = SyncPolicy::default()
            .with_max_retry_attempts(3)
            .with_retry_enabled(false);
        assert_eq!(policy.effective_retries(), 0);
    }

    #[test]
    fn test_fetch_operation_default() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.fetch_operation_for(&EntityType::bill()), "get_bill");
    }

    #[test]
    fn test_validate_rejects_inverted_ttls() {
        let set = PolicySet::new(SyncPolicy::default().with_soft_ttl_secs(100).with_hard_ttl_secs(10));
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_hard_ttl() {
        let set = PolicySet::new(SyncPolicy::default()).with_policy(
            EntityType::balance(),
            SyncPolicy::default().with_hard_ttl_secs(u64::MAX / 2),
        );
        let err = set.validate().unwrap_err();
        assert!(err.contains("balance"));
        assert!(err.contains("hard_ttl_secs"));
    }
}
