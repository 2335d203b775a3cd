// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::store::Account;
use crate::types::{AccountTier, StoreBackend};

/// Top-level configuration as read from `Auditflow.toml`.
///
/// ```toml
/// [engine]
/// max_attempts = 3
/// workers = 4
/// lock_ttl = "300s"
/// reconcile_interval = "60s"
///
/// [store]
/// backend = "file"
/// path = ".auditflow"
///
/// [[account]]
/// id = "acme"
/// tier = "capped"
/// allowances = { scans = 100, tests = 50, flowruns = 20 }
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: RawEngineSection,

    #[serde(default)]
    pub store: StoreSection,

    /// Accounts created on startup if they do not exist yet.
    #[serde(default)]
    pub account: Vec<AccountSeed>,
}

/// `[engine]` section, durations still as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct RawEngineSection {
    /// Ledger ceiling per component.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long a component lock may be held before it expires.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl: String,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,

    /// Artificial latency of simulated components.
    #[serde(default = "default_component_delay")]
    pub component_delay: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_workers() -> usize {
    4
}

fn default_lock_ttl() -> String {
    "300s".to_string()
}

fn default_reconcile_interval() -> String {
    "60s".to_string()
}

fn default_component_delay() -> String {
    "50ms".to_string()
}

impl Default for RawEngineSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            workers: default_workers(),
            lock_ttl: default_lock_ttl(),
            reconcile_interval: default_reconcile_interval(),
            component_delay: default_component_delay(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Root directory of the file backend. Lock files live in `locks/`
    /// below it.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".auditflow")
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// `[[account]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSeed {
    pub id: String,

    #[serde(default)]
    pub tier: AccountTier,

    #[serde(default = "default_active")]
    pub active: bool,

    /// Usage kind (`scans`, `tests`, `caseruns`, `flowruns`) to allowance.
    #[serde(default)]
    pub allowances: BTreeMap<String, u64>,
}

fn default_active() -> bool {
    true
}

/// Validated engine options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub max_attempts: u32,
    pub workers: usize,
    pub lock_ttl: Duration,
    pub reconcile_interval: Duration,
    pub component_delay: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            workers: default_workers(),
            lock_ttl: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(60),
            component_delay: Duration::from_millis(50),
        }
    }
}

/// Validated configuration used by the rest of the application.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub engine: EngineOptions,
    pub store: StoreSection,
    pub accounts: Vec<Account>,
}
