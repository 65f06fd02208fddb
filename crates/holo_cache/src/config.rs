//! Store-side configuration: the JSON config file and the effective
//! per-cache settings derived from it.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Plain non-transactional cache used by the bulk put workload.
pub const CACHE_DEFAULT: &str = "cache";
/// Transactional cache used by the tx workloads.
pub const CACHE_TRANSACTIONAL: &str = "transactional";
/// Indexed cache used by the query workloads.
pub const CACHE_QUERY: &str = "queryCache";

/// Every cache a member defines on startup.
pub const STANDARD_CACHES: [&str; 3] = [CACHE_DEFAULT, CACHE_TRANSACTIONAL, CACHE_QUERY];

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Transaction locking strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TxConcurrency {
    /// Validate read/write versions at commit.
    #[default]
    Optimistic,
    /// Lock keys on write and hold the lock until commit or rollback.
    Pessimistic,
}

impl fmt::Display for TxConcurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxConcurrency::Optimistic => f.write_str("OPTIMISTIC"),
            TxConcurrency::Pessimistic => f.write_str("PESSIMISTIC"),
        }
    }
}

/// Transaction isolation level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => f.write_str("READ_COMMITTED"),
            IsolationLevel::RepeatableRead => f.write_str("REPEATABLE_READ"),
            IsolationLevel::Serializable => f.write_str("SERIALIZABLE"),
        }
    }
}

/// Distribution mode of a cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    DistSync,
    DistAsync,
}

impl CacheMode {
    pub fn from_async(async_mode: bool) -> Self {
        if async_mode {
            CacheMode::DistAsync
        } else {
            CacheMode::DistSync
        }
    }
}

/// Per-cache overrides read from the store config file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheOverrides {
    #[serde(default)]
    pub transactional: Option<bool>,
    #[serde(default)]
    pub indexed: Option<bool>,
}

/// Contents of the store config file.
///
/// Example:
/// ```json
/// { "cluster_name": "bench", "lock_timeout_ms": 5000,
///   "caches": { "cache": { "indexed": true } } }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default)]
    pub caches: BTreeMap<String, CacheOverrides>,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cluster_name: None,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            caches: BTreeMap::new(),
        }
    }
}

impl StoreConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)
            .with_context(|| format!("read store config {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parse store config {}", path.display()))
    }

    /// Effective settings for `name` given the benchmark's cluster parameters.
    pub fn settings_for(&self, name: &str, params: &ClusterParams) -> CacheSettings {
        let (mut transactional, mut indexed) = match name {
            CACHE_TRANSACTIONAL => (true, false),
            CACHE_QUERY => (false, true),
            _ => (false, false),
        };
        if let Some(overrides) = self.caches.get(name) {
            transactional = overrides.transactional.unwrap_or(transactional);
            indexed = overrides.indexed.unwrap_or(indexed);
        }
        CacheSettings {
            name: name.to_string(),
            mode: CacheMode::from_async(params.async_mode),
            owners: params.backups + 1,
            transactional,
            indexed,
            concurrency: params.concurrency,
            isolation: params.isolation,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms.max(1)),
        }
    }
}

/// Cluster-wide parameters that shape every cache definition.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClusterParams {
    pub backups: usize,
    pub async_mode: bool,
    pub concurrency: TxConcurrency,
    pub isolation: IsolationLevel,
}

/// Effective definition of one named cache.
#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub name: String,
    pub mode: CacheMode,
    /// Number of copies per key (`backups + 1`).
    pub owners: usize,
    pub transactional: bool,
    pub indexed: bool,
    pub concurrency: TxConcurrency,
    pub isolation: IsolationLevel,
    /// Upper bound on waiting for a pessimistic key lock.
    pub lock_timeout: Duration,
}

impl CacheSettings {
    /// Settings for a standalone cache, mostly for tests and tools.
    pub fn local(name: &str, transactional: bool, indexed: bool) -> Self {
        Self {
            name: name.to_string(),
            mode: CacheMode::DistSync,
            owners: 1,
            transactional,
            indexed,
            concurrency: TxConcurrency::default(),
            isolation: IsolationLevel::default(),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn standard_caches_get_their_templates() {
        let cfg = StoreConfig::default();
        let params = ClusterParams {
            backups: 2,
            ..ClusterParams::default()
        };
        let tx = cfg.settings_for(CACHE_TRANSACTIONAL, &params);
        assert!(tx.transactional);
        assert!(!tx.indexed);
        assert_eq!(tx.owners, 3);

        let query = cfg.settings_for(CACHE_QUERY, &params);
        assert!(query.indexed);
        assert!(!query.transactional);
    }

    #[test]
    fn load_applies_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cluster_name":"bench-a","lock_timeout_ms":250,"caches":{{"cache":{{"transactional":true}}}}}}"#
        )
        .unwrap();

        let cfg = StoreConfig::load(file.path()).unwrap();
        assert_eq!(cfg.cluster_name.as_deref(), Some("bench-a"));
        let settings = cfg.settings_for(CACHE_DEFAULT, &ClusterParams::default());
        assert!(settings.transactional);
        assert_eq!(settings.lock_timeout, Duration::from_millis(250));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = StoreConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(format!("{err:#}").contains("read store config"));
    }
}
