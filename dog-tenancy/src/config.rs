//! # Tenancy configuration
//!
//! Two layers, mirroring the rest of DogRS:
//!
//! - [`ConfigStore`] / [`ConfigSnapshot`]: a plain string key/value store that
//!   applications fill however they like (files, env, Consul, ...).
//! - [`TenancyConfig`]: the typed view, built from a snapshot with
//!   [`TenancyConfig::from_snapshot`]. Missing keys fall back to defaults.
//!
//! ## Environment overrides
//!
//! ```rust
//! use dog_tenancy::config::{ConfigStore, TenancyConfig};
//!
//! // TENANCY__CACHE__POSITIVE_TTL_MS=60000 -> cache.positive_ttl_ms
//! let store = ConfigStore::from_env("TENANCY__");
//! let config = TenancyConfig::from_snapshot(&store.snapshot()).unwrap();
//! assert!(config.cache.negative_ttl <= config.cache.positive_ttl);
//! ```
//!
//! ## Defaults
//!
//! | key | default |
//! |---|---|
//! | `cache.positive_ttl_ms` | 300 000 |
//! | `cache.negative_ttl_ms` | 15 000 |
//! | `directory.timeout_ms` | 2 000 |
//! | `domain.min_labels` | 3 |
//! | `domain.reserved_labels` | `www,api,admin` |
//! | `pool.max_per_tenant` | 8 |
//! | `pool.max_idle_per_tenant` | 4 |
//! | `pool.idle_timeout_ms` | 600 000 |
//! | `pool.acquire_timeout_ms` | 5 000 |
//! | `pool.reap_interval_ms` | 60 000 |

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::errors::ConfigError;

#[derive(Debug, Default)]
pub struct ConfigStore {
    values: HashMap<String, String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    /// Collect every env var starting with `prefix`.
    ///
    /// `PREFIX__POOL__MAX_PER_TENANT` becomes `pool.max_per_tenant`.
    pub fn from_env(prefix: &str) -> Self {
        Self::from_vars(prefix, std::env::vars())
    }

    pub fn from_vars<I>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut store = Self::new();
        for (key, value) in vars {
            if let Some(stripped) = key.strip_prefix(prefix) {
                let normalized = stripped.to_lowercase().replace("__", ".");
                store.set(normalized, value);
            }
        }
        store
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            map: self.values.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    map: HashMap<String, String>,
}

impl ConfigSnapshot {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(|s| s.as_str())
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        self.parse(key, "an unsigned integer")
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.parse(key, "a boolean")
    }

    /// Durations are stored as whole milliseconds.
    pub fn get_millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self
            .parse::<u64>(key, "milliseconds")?
            .map(Duration::from_millis))
    }

    /// Comma separated list, blanks dropped.
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    fn parse<T: std::str::FromStr>(
        &self,
        key: &str,
        expected: &'static str,
    ) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid {
                    key: key.to_string(),
                    value: raw.to_string(),
                    expected,
                }),
        }
    }
}

/// Freshness bounds for the resolution cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a found tenant may be served from cache.
    pub positive_ttl: Duration,

    /// How long "no such tenant" is remembered. Kept short so freshly
    /// provisioned tenants are rediscovered quickly.
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(15),
        }
    }
}

/// Rule for deriving a tenant label from a request host.
#[derive(Debug, Clone)]
pub struct DomainRule {
    /// Hosts with fewer labels than this carry no tenant (`example.com`).
    pub min_labels: usize,

    /// Leftmost labels that are never tenants (`www.example.com`).
    pub reserved_labels: Vec<String>,
}

impl Default for DomainRule {
    fn default() -> Self {
        Self {
            min_labels: 3,
            reserved_labels: vec!["www".to_string(), "api".to_string(), "admin".to_string()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Upper bound for a single directory round-trip.
    pub timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

/// Per-tenant handle pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handles concurrently checked out for one tenant.
    pub max_per_tenant: usize,

    /// Connections kept warm per tenant after release.
    pub max_idle_per_tenant: usize,

    /// A pool with nothing checked out for this long is evicted.
    pub idle_timeout: Duration,

    /// How long `open` waits for a free slot before giving up.
    pub acquire_timeout: Duration,

    /// Interval of the background pool reaper.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_tenant: 8,
            max_idle_per_tenant: 4,
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(5),
            reap_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TenancyConfig {
    pub cache: CacheConfig,
    pub domain: DomainRule,
    pub directory: DirectoryConfig,
    pub pool: PoolConfig,
}

impl TenancyConfig {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ttl) = snapshot.get_millis("cache.positive_ttl_ms")? {
            config.cache.positive_ttl = ttl;
        }
        if let Some(ttl) = snapshot.get_millis("cache.negative_ttl_ms")? {
            config.cache.negative_ttl = ttl;
        }
        if let Some(timeout) = snapshot.get_millis("directory.timeout_ms")? {
            config.directory.timeout = timeout;
        }
        if let Some(min) = snapshot.get_usize("domain.min_labels")? {
            config.domain.min_labels = min;
        }
        if let Some(labels) = snapshot.get_list("domain.reserved_labels") {
            config.domain.reserved_labels = labels;
        }
        if let Some(max) = snapshot.get_usize("pool.max_per_tenant")? {
            config.pool.max_per_tenant = max;
        }
        if let Some(max) = snapshot.get_usize("pool.max_idle_per_tenant")? {
            config.pool.max_idle_per_tenant = max;
        }
        if let Some(timeout) = snapshot.get_millis("pool.idle_timeout_ms")? {
            config.pool.idle_timeout = timeout;
        }
        if let Some(timeout) = snapshot.get_millis("pool.acquire_timeout_ms")? {
            config.pool.acquire_timeout = timeout;
        }
        if let Some(interval) = snapshot.get_millis("pool.reap_interval_ms")? {
            config.pool.reap_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.negative_ttl > self.cache.positive_ttl {
            return Err(ConfigError::OutOfRange {
                key: "cache.negative_ttl_ms".to_string(),
                reason: "must not exceed cache.positive_ttl_ms".to_string(),
            });
        }
        if self.domain.min_labels < 2 {
            return Err(ConfigError::OutOfRange {
                key: "domain.min_labels".to_string(),
                reason: "a tenant label needs at least one parent domain label".to_string(),
            });
        }
        if self.pool.max_per_tenant == 0 || self.pool.max_per_tenant > Semaphore::MAX_PERMITS {
            return Err(ConfigError::OutOfRange {
                key: "pool.max_per_tenant".to_string(),
                reason: format!("must be between 1 and {}", Semaphore::MAX_PERMITS),
            });
        }
        if self.pool.reap_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "pool.reap_interval_ms".to_string(),
                reason: "must be at least 1 ms".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_keys_are_normalized() {
        let store = ConfigStore::from_vars(
            "TENANCY__",
            vars(&[
                ("TENANCY__CACHE__POSITIVE_TTL_MS", "60000"),
                ("OTHER__CACHE__POSITIVE_TTL_MS", "1"),
            ]),
        );
        assert_eq!(store.get("cache.positive_ttl_ms"), Some("60000"));
        assert_eq!(store.snapshot().get("cache.positive_ttl_ms"), Some("60000"));
    }

    #[test]
    fn snapshot_overrides_defaults() {
        let store = ConfigStore::from_vars(
            "T__",
            vars(&[
                ("T__CACHE__POSITIVE_TTL_MS", "1000"),
                ("T__CACHE__NEGATIVE_TTL_MS", "100"),
                ("T__DOMAIN__MIN_LABELS", "4"),
                ("T__DOMAIN__RESERVED_LABELS", "WWW, status ,"),
                ("T__POOL__MAX_PER_TENANT", "2"),
            ]),
        );
        let config = TenancyConfig::from_snapshot(&store.snapshot()).unwrap();
        assert_eq!(config.cache.positive_ttl, Duration::from_millis(1000));
        assert_eq!(config.cache.negative_ttl, Duration::from_millis(100));
        assert_eq!(config.domain.min_labels, 4);
        assert_eq!(config.domain.reserved_labels, vec!["www", "status"]);
        assert_eq!(config.pool.max_per_tenant, 2);
        assert_eq!(config.pool.max_idle_per_tenant, 4);
    }

    #[test]
    fn malformed_value_is_reported_with_key() {
        let mut store = ConfigStore::new();
        store.set("pool.max_per_tenant", "many");
        let err = TenancyConfig::from_snapshot(&store.snapshot()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "pool.max_per_tenant"));
    }

    #[test]
    fn zero_reap_interval_is_rejected() {
        let mut store = ConfigStore::new();
        store.set("pool.reap_interval_ms", "0");
        let err = TenancyConfig::from_snapshot(&store.snapshot()).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "pool.reap_interval_ms"));
    }

    #[test]
    fn pool_size_is_bounded() {
        for max in ["0".to_string(), (Semaphore::MAX_PERMITS + 1).to_string()] {
            let mut store = ConfigStore::new();
            store.set("pool.max_per_tenant", max);
            let err = TenancyConfig::from_snapshot(&store.snapshot()).unwrap_err();
            assert!(matches!(err, ConfigError::OutOfRange { ref key, .. } if key == "pool.max_per_tenant"));
        }
    }

    #[test]
    fn negative_ttl_longer_than_positive_is_rejected() {
        let mut store = ConfigStore::new();
        store.set("cache.positive_ttl_ms", "10");
        store.set("cache.negative_ttl_ms", "20");
        assert!(matches!(
            TenancyConfig::from_snapshot(&store.snapshot()),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
