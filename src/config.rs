use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the observation importer.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Batch accumulation policy.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Dimension catalog connection configuration.
    #[serde(default)]
    pub catalog: CatalogConfig,

    /// Order and id cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Graph store configuration.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Input and output stream locations.
    #[serde(default)]
    pub io: IoConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Upper bound on ordered resource teardown. Default: 10s.
    #[serde(
        default = "default_graceful_shutdown_timeout",
        with = "humantime_serde"
    )]
    pub graceful_shutdown_timeout: Duration,
}

/// Batch accumulation policy.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum events per batch. Default: 1000.
    #[serde(default = "default_batch_size")]
    pub size: usize,

    /// Flush a non-empty batch after this long. Default: 200ms.
    #[serde(default = "default_batch_wait", with = "humantime_serde")]
    pub wait: Duration,
}

/// Dimension catalog connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Catalog HTTP endpoint (e.g., "http://localhost:22000").
    #[serde(default)]
    pub endpoint: String,

    /// Bearer token sent with every request. Empty disables auth.
    #[serde(default)]
    pub auth_token: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_catalog_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Order and id cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Entry time-to-live. Default: 60s.
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// How often expired entries are dropped. Default: 5m.
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
}

/// Graph store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    Memory,
    Neo4j,
}

impl Default for GraphKind {
    fn default() -> Self {
        Self::Memory
    }
}

/// Graph store configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GraphConfig {
    /// Backend to write observations to. Default: memory.
    #[serde(default)]
    pub kind: GraphKind,

    /// Neo4j transactional HTTP endpoint configuration.
    #[serde(default)]
    pub neo4j: Neo4jConfig,
}

/// Neo4j transactional HTTP endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Neo4jConfig {
    /// Server URL (e.g., "http://localhost:7474").
    #[serde(default)]
    pub endpoint: String,

    /// Database name. Default: "neo4j".
    #[serde(default = "default_neo4j_database")]
    pub database: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Request timeout. Default: 30s.
    #[serde(default = "default_neo4j_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Input and output stream locations. "-" selects stdin/stdout/stderr.
#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
    /// Line-delimited extracted events. Default: "-" (stdin).
    #[serde(default = "default_stdio")]
    pub input: String,

    /// Inserted-event output. Default: "-" (stdout).
    #[serde(default = "default_stdio")]
    pub results: String,

    /// Error-event output. Default: "-" (stderr).
    #[serde(default = "default_stdio")]
    pub errors: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_graceful_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Largest accepted `batch.size`.
pub const MAX_BATCH_SIZE: usize = i32::MAX as usize;

fn default_batch_size() -> usize {
    1000
}

fn default_batch_wait() -> Duration {
    Duration::from_millis(200)
}

fn default_catalog_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_neo4j_database() -> String {
    "neo4j".to_string()
}

fn default_neo4j_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_stdio() -> String {
    "-".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            batch: BatchConfig::default(),
            catalog: CatalogConfig::default(),
            cache: CacheConfig::default(),
            graph: GraphConfig::default(),
            io: IoConfig::default(),
            health: HealthConfig::default(),
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            wait: default_batch_wait(),
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            auth_token: String::new(),
            timeout: default_catalog_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_cache_ttl(),
            purge_interval: default_purge_interval(),
        }
    }
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_neo4j_database(),
            username: String::new(),
            password: String::new(),
            timeout: default_neo4j_timeout(),
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            input: default_stdio(),
            results: default_stdio(),
            errors: default_stdio(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Log level to run with: the command-line override if given, else the
    /// configured level.
    pub fn effective_log_level<'a>(&'a self, cli_override: Option<&'a str>) -> &'a str {
        cli_override.unwrap_or(&self.log_level)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.batch.size == 0 {
            bail!("batch.size must be positive");
        }

        // Inserted counts are published as 32-bit integers.
        if self.batch.size > MAX_BATCH_SIZE {
            bail!("batch.size must be at most {MAX_BATCH_SIZE}");
        }

        if self.batch.wait.is_zero() {
            bail!("batch.wait must be positive");
        }

        if self.catalog.endpoint.is_empty() {
            bail!("catalog.endpoint is required");
        }

        if self.cache.ttl.is_zero() {
            bail!("cache.ttl must be positive");
        }

        if self.cache.purge_interval.is_zero() {
            bail!("cache.purge_interval must be positive");
        }

        if self.graph.kind == GraphKind::Neo4j && self.graph.neo4j.endpoint.is_empty() {
            bail!("graph.neo4j.endpoint is required when graph.kind is neo4j");
        }

        if self.io.input.is_empty() || self.io.results.is_empty() || self.io.errors.is_empty() {
            bail!("io.input, io.results and io.errors must not be empty");
        }

        if self.graceful_shutdown_timeout.is_zero() {
            bail!("graceful_shutdown_timeout must be positive");
        }

        Ok(())
    }
}
