//! Engine configuration
//!
//! Layered settings: built-in defaults, then a TOML profile, then an env
//! file, then the process environment. Unknown keys in the profile are
//! ignored for forward compatibility.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use girder_core::RetryPolicy;
use girder_storage::{BackendKind, MemoryStore};

use crate::executor::{
    AsyncLocalExecutor, Executor, LocalExecutor, MemoryExecutor, ProcessExecutor, StubExecutor,
};

/// Environment variable naming the TOML profile
pub const CONFIG_PATH_ENV: &str = "GIRDER_CONFIG";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("backend {0:?} requires an externally constructed store")]
    UnsupportedBackend(BackendKind),

    #[error("executor {0:?} requires an externally constructed client")]
    UnsupportedExecutor(ExecutorKind),
}

/// Executor selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Memory,
    #[default]
    ThreadPool,
    AsyncPool,
    ProcessPool,
    ExternalBroker,
    Stub,
}

impl std::str::FromStr for ExecutorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(Self::Memory),
            "thread-pool" => Ok(Self::ThreadPool),
            "async-pool" => Ok(Self::AsyncPool),
            "process-pool" => Ok(Self::ProcessPool),
            "external-broker" => Ok(Self::ExternalBroker),
            "stub" => Ok(Self::Stub),
            _ => Err(()),
        }
    }
}

/// Per-executor options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub kind: ExecutorKind,

    /// Thread-pool width
    pub max_workers: usize,

    /// Cooperative-task bound
    pub max_concurrency: usize,

    /// Command line for the process pool
    pub process_command: Vec<String>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            max_workers: 4,
            max_concurrency: 8,
            process_command: vec![],
        }
    }
}

/// Per-downstream rate-limit defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Sustained tokens per second
    pub rate: f64,

    /// Burst capacity
    pub capacity: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate: 10.0,
            capacity: 20,
        }
    }
}

/// Engine settings object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persistence backend URL; scheme selects the backend
    pub database_url: String,

    pub executor: ExecutorSettings,

    /// Scheduler tick, in milliseconds
    pub scheduler_tick_ms: u64,

    /// Reconciler poll interval, in milliseconds
    pub reconcile_interval_ms: u64,

    /// Ledger retention, in days
    pub retention_days: u32,

    /// Run-level retry default
    pub retry: RetryPolicy,

    /// Concurrency-guard lock TTL, in seconds
    pub lock_ttl_seconds: u64,

    /// Rate-limit defaults per named downstream
    pub rate_limits: HashMap<String, RateLimitSettings>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "memory://".to_string(),
            executor: ExecutorSettings::default(),
            scheduler_tick_ms: 1_000,
            reconcile_interval_ms: 10_000,
            retention_days: 30,
            retry: RetryPolicy::default(),
            lock_ttl_seconds: 60,
            rate_limits: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load with full layering: defaults → TOML profile (from
    /// `GIRDER_CONFIG` or `girder.toml`) → env file → environment.
    pub fn load() -> Result<Self, ConfigError> {
        // Env file first so the environment overrides below see it.
        dotenvy::dotenv().ok();
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "girder.toml".to_string());
        let mut config = if Path::new(&path).exists() {
            Self::from_toml_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse a TOML profile over the defaults
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply recognized `GIRDER_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var("GIRDER_DATABASE_URL") {
            self.database_url = url;
        }
        if let Ok(kind) = std::env::var("GIRDER_EXECUTOR") {
            self.executor.kind = kind.parse().map_err(|_| ConfigError::InvalidValue {
                key: "GIRDER_EXECUTOR".to_string(),
                value: kind,
            })?;
        }
        self.executor.max_workers =
            env_parse("GIRDER_MAX_WORKERS", self.executor.max_workers)?;
        self.executor.max_concurrency =
            env_parse("GIRDER_MAX_CONCURRENCY", self.executor.max_concurrency)?;
        self.scheduler_tick_ms = env_parse("GIRDER_SCHEDULER_TICK_MS", self.scheduler_tick_ms)?;
        self.reconcile_interval_ms =
            env_parse("GIRDER_RECONCILE_INTERVAL_MS", self.reconcile_interval_ms)?;
        self.lock_ttl_seconds = env_parse("GIRDER_LOCK_TTL_SECONDS", self.lock_ttl_seconds)?;
        Ok(())
    }

    /// Persistence backend implied by the URL scheme
    pub fn backend(&self) -> Result<BackendKind, ConfigError> {
        BackendKind::from_url(&self.database_url).map_err(|e| ConfigError::InvalidValue {
            key: "database_url".to_string(),
            value: e.to_string(),
        })
    }

    /// Construct the store for in-process backends.
    ///
    /// Database-backed stores need a connection pool and are constructed
    /// by the embedding application; this returns `UnsupportedBackend`
    /// for them so callers wire the pool themselves.
    pub fn build_memory_store(&self) -> Result<Arc<MemoryStore>, ConfigError> {
        match self.backend()? {
            BackendKind::Memory => Ok(Arc::new(MemoryStore::new())),
            other => Err(ConfigError::UnsupportedBackend(other)),
        }
    }

    /// Construct the configured executor.
    ///
    /// `external-broker` needs a broker client and is wired by the
    /// embedding application.
    pub fn build_executor(&self) -> Result<Arc<dyn Executor>, ConfigError> {
        let settings = &self.executor;
        debug!(kind = ?settings.kind, "building executor");
        match settings.kind {
            ExecutorKind::Memory => Ok(Arc::new(MemoryExecutor::new())),
            ExecutorKind::ThreadPool => Ok(Arc::new(LocalExecutor::new(settings.max_workers))),
            ExecutorKind::AsyncPool => {
                Ok(Arc::new(AsyncLocalExecutor::new(settings.max_concurrency)))
            }
            ExecutorKind::ProcessPool => {
                let executor =
                    ProcessExecutor::new(settings.process_command.clone(), settings.max_workers)
                        .map_err(|e| ConfigError::InvalidValue {
                            key: "executor.process_command".to_string(),
                            value: e.to_string(),
                        })?;
                Ok(Arc::new(executor))
            }
            ExecutorKind::Stub => Ok(Arc::new(StubExecutor::new())),
            ExecutorKind::ExternalBroker => {
                Err(ConfigError::UnsupportedExecutor(ExecutorKind::ExternalBroker))
            }
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, current: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.database_url, "memory://");
        assert_eq!(config.executor.kind, ExecutorKind::ThreadPool);
        assert_eq!(config.backend().unwrap(), BackendKind::Memory);
    }

    #[test]
    fn test_toml_profile_overrides_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            database_url = "postgres://localhost/girder"
            lock_ttl_seconds = 120

            [executor]
            kind = "async-pool"
            max_concurrency = 32

            [rate_limits.sec-api]
            rate = 5.0
            capacity = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.backend().unwrap(), BackendKind::Postgres);
        assert_eq!(config.executor.kind, ExecutorKind::AsyncPool);
        assert_eq!(config.executor.max_concurrency, 32);
        assert_eq!(config.lock_ttl(), Duration::from_secs(120));
        assert_eq!(config.rate_limits["sec-api"].capacity, 10);
        // Untouched keys keep their defaults.
        assert_eq!(config.scheduler_tick_ms, 1_000);
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = EngineConfig::from_toml(
            r#"
            database_url = "memory://"
            some_future_knob = "whatever"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_url, "memory://");
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml("database_url = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_executor_kind_parsing() {
        assert_eq!("thread-pool".parse(), Ok(ExecutorKind::ThreadPool));
        assert_eq!("external-broker".parse(), Ok(ExecutorKind::ExternalBroker));
        assert!("warp-drive".parse::<ExecutorKind>().is_err());
    }

    #[test]
    fn test_build_executor_for_local_kinds() {
        let mut config = EngineConfig::default();
        for kind in [
            ExecutorKind::Memory,
            ExecutorKind::ThreadPool,
            ExecutorKind::AsyncPool,
            ExecutorKind::Stub,
        ] {
            config.executor.kind = kind;
            assert!(config.build_executor().is_ok(), "{kind:?}");
        }
        config.executor.kind = ExecutorKind::ExternalBroker;
        assert!(matches!(
            config.build_executor(),
            Err(ConfigError::UnsupportedExecutor(_))
        ));
    }
}
