//! Runtime configuration
//!
//! Deployment settings come from environment variables; per-entity-type
//! sync policies come from an optional JSON file and can be hot-reloaded
//! through [`PolicyHandle`].

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::domain::PolicySet;
use crate::infra::{Result, RetryConfig, SyncError};
use crate::sync::{OrchestratorConfig, ReconciliationConfig};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://ledger-sync.db?mode=rwc";

/// Deployment configuration for the synchronization core
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// JSON policy file; built-in defaults apply when unset
    pub policy_path: Option<PathBuf>,
    /// Constrained deployments: no retries beyond the first attempt
    pub simple_mode: bool,
    pub scheduler_enabled: bool,
    pub reconcile_interval: Duration,
    pub lease_ttl: Duration,
    pub lease_wait: Duration,
    pub remote_timeout: Duration,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub worker_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 5,
            policy_path: None,
            simple_mode: false,
            scheduler_enabled: true,
            reconcile_interval: Duration::from_secs(86_400),
            lease_ttl: Duration::from_secs(30),
            lease_wait: Duration::from_millis(2_000),
            remote_timeout: Duration::from_millis(10_000),
            retry_initial_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(5_000),
            worker_concurrency: 4,
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| {
            SyncError::Configuration(format!("{} has invalid value '{}': {}", key, value, e))
        })
    })
    .transpose()
}

fn parse_flag(key: &str, raw: Option<String>) -> Result<Option<bool>> {
    raw.map(|value| match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(SyncError::Configuration(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    })
    .transpose()
}

impl SyncConfig {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_source(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse::<u64>(key, lookup(key))?
                .map(Duration::from_secs)
                .unwrap_or(default))
        };
        let millis = |key: &str, default: Duration| -> Result<Duration> {
            Ok(parse::<u64>(key, lookup(key))?
                .map(Duration::from_millis)
                .unwrap_or(default))
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse("MAX_DB_CONNECTIONS", lookup("MAX_DB_CONNECTIONS"))?
                .unwrap_or(defaults.max_connections),
            policy_path: lookup("SYNC_POLICY_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            simple_mode: parse_flag("SYNC_SIMPLE_MODE", lookup("SYNC_SIMPLE_MODE"))?
                .unwrap_or(defaults.simple_mode),
            scheduler_enabled: parse_flag(
                "SYNC_SCHEDULER_ENABLED",
                lookup("SYNC_SCHEDULER_ENABLED"),
            )?
            .unwrap_or(defaults.scheduler_enabled),
            reconcile_interval: secs("SYNC_RECONCILE_INTERVAL_SECS", defaults.reconcile_interval)?,
            lease_ttl: secs("SYNC_LEASE_TTL_SECS", defaults.lease_ttl)?,
            lease_wait: millis("SYNC_LEASE_WAIT_MS", defaults.lease_wait)?,
            remote_timeout: millis("SYNC_REMOTE_TIMEOUT_MS", defaults.remote_timeout)?,
            retry_initial_delay: millis(
                "SYNC_RETRY_INITIAL_DELAY_MS",
                defaults.retry_initial_delay,
            )?,
            retry_max_delay: millis("SYNC_RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            worker_concurrency: parse(
                "SYNC_WORKER_CONCURRENCY",
                lookup("SYNC_WORKER_CONCURRENCY"),
            )?
            .unwrap_or(defaults.worker_concurrency),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(SyncError::Configuration(
                "SYNC_LEASE_TTL_SECS must be positive".to_string(),
            ));
        }
        if self.reconcile_interval.is_zero() {
            return Err(SyncError::Configuration(
                "SYNC_RECONCILE_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.worker_concurrency == 0 {
            return Err(SyncError::Configuration(
                "SYNC_WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.retry_max_delay < self.retry_initial_delay {
            return Err(SyncError::Configuration(
                "SYNC_RETRY_MAX_DELAY_MS must be >= SYNC_RETRY_INITIAL_DELAY_MS".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::default()
            .with_initial_delay(self.retry_initial_delay)
            .with_max_delay(self.retry_max_delay)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            retry: self.retry_config(),
            lease_ttl: self.lease_ttl,
            lease_wait: self.lease_wait,
            remote_timeout: self.remote_timeout,
            simple_mode: self.simple_mode,
            ..OrchestratorConfig::default()
        }
    }

    pub fn reconciliation_config(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            enabled: self.scheduler_enabled,
            interval: self.reconcile_interval,
            concurrency: self.worker_concurrency,
            ..ReconciliationConfig::default()
        }
    }

    /// Policies from `policy_path`, or the built-in defaults
    pub fn load_policies(&self) -> Result<PolicySet> {
        match &self.policy_path {
            Some(path) => load_policy_file(path),
            None => Ok(PolicySet::default()),
        }
    }
}

/// Parse and validate a JSON policy file
pub fn load_policy_file(path: &Path) -> Result<PolicySet> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        SyncError::Configuration(format!("cannot read policy file {}: {}", path.display(), e))
    })?;
    let policies: PolicySet = serde_json::from_str(&raw).map_err(|e| {
        SyncError::Configuration(format!("invalid policy file {}: {}", path.display(), e))
    })?;
    policies.validate().map_err(SyncError::Configuration)?;
    Ok(policies)
}

/// Shared, hot-reloadable view of the active policies.
///
/// Readers take a cheap snapshot per call; a reload swaps the whole set so
/// one call never sees a mix of old and new policies.
#[derive(Clone)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<PolicySet>>>,
}

impl PolicyHandle {
    pub fn new(policies: PolicySet) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(policies))),
        }
    }

    pub fn current(&self) -> Arc<PolicySet> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a new policy set after validating it
    pub fn replace(&self, policies: PolicySet) -> Result<()> {
        policies.validate().map_err(SyncError::Configuration)?;
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(policies);
        tracing::info!("Sync policies replaced");
        Ok(())
    }

    /// Re-read a policy file; the active set is kept if the file is invalid
    pub fn reload_from_path(&self, path: &Path) -> Result<()> {
        let policies = load_policy_file(path)?;
        self.replace(policies)
    }
}

impl Default for PolicyHandle {
    fn default() -> Self {
        Self::new(PolicySet::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EntityType, SyncPolicy};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = SyncConfig::from_source(|_| None).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.reconcile_interval, Duration::from_secs(86_400));
        assert!(!config.simple_mode);
        assert!(config.scheduler_enabled);
        assert_eq!(config.orchestrator_config().retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let config = SyncConfig::from_source(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("SYNC_SIMPLE_MODE", "true"),
            ("SYNC_SCHEDULER_ENABLED", "0"),
            ("SYNC_LEASE_WAIT_MS", "150"),
            ("SYNC_WORKER_CONCURRENCY", "16"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(config.orchestrator_config().simple_mode);
        assert!(!config.reconciliation_config().enabled);
        assert_eq!(config.lease_wait, Duration::from_millis(150));
        assert_eq!(config.reconciliation_config().concurrency, 16);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SyncConfig::from_source(lookup(&[("SYNC_LEASE_TTL_SECS", "soon")])).is_err());
        assert!(SyncConfig::from_source(lookup(&[("SYNC_SIMPLE_MODE", "maybe")])).is_err());
        assert!(SyncConfig::from_source(lookup(&[("SYNC_WORKER_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn test_policy_handle_reload_keeps_old_set_on_error() {
        let dir = std::env::temp_dir().join(format!("ledger-sync-policy-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("policies.json");

        std::fs::write(
            &path,
            r#"{"default": {"soft_ttl_secs": 60, "hard_ttl_secs": 600, "max_retry_attempts": 1}}"#,
        )
        .unwrap();
        let handle = PolicyHandle::default();
        handle.reload_from_path(&path).unwrap();
        assert_eq!(handle.current().policy_for(&EntityType::bill()).soft_ttl_secs, 60);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(handle.reload_from_path(&path).is_err());
        assert_eq!(handle.current().policy_for(&EntityType::bill()).soft_ttl_secs, 60);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_replace_validates() {
        let handle = PolicyHandle::default();
        let bad = PolicySet::new(SyncPolicy::default().with_soft_ttl_secs(10).with_hard_ttl_secs(5));
        assert!(handle.replace(bad).is_err());
    }
}
