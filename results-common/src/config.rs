//! Configuration loading for the results services
//!
//! Values resolve in priority order:
//! 1. Command-line argument (highest priority, applied by the binary)
//! 2. Environment variable (applied by the binary through clap)
//! 3. TOML config file
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory name under the platform config/data directories
const APP_DIR: &str = "results-service";

pub const ENV_FEED_URL: &str = "RESULTS_FEED_URL";
pub const ENV_DATABASE_PATH: &str = "RESULTS_DATABASE_PATH";
pub const ENV_POLL_INTERVAL_SECS: &str = "RESULTS_POLL_INTERVAL_SECS";
pub const ENV_REDIS_URL: &str = "RESULTS_REDIS_URL";

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// URL of the published CSV results feed
    pub feed_url: String,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Seconds between scheduled ingestion cycles
    pub poll_interval_secs: u64,
    /// Hard deadline for one ingestion cycle
    pub cycle_deadline_secs: u64,
    /// Upper bound on a single read against the store
    pub read_timeout_ms: u64,
    /// Capacity of the ingestion event channel
    pub events_capacity: usize,
    pub fetch: FetchConfig,
    pub normalize: NormalizeConfig,
    pub cache: CacheConfig,
}

/// Feed retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

/// Normalization policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizeConfig {
    /// Largest tolerated share of malformed rows (0.0 - 1.0)
    pub max_skipped_ratio: f64,
}

/// Cache backend selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Memory,
    Redis,
    None,
}

/// Aggregate cache settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackendKind,
    pub redis_url: Option<String>,
    /// Per-key expiry; bounds memory only, consistency comes from version tags
    pub ttl_secs: u64,
    /// View kinds recomputed right after each commit (e.g. "summary")
    pub warm_views: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            database_path: default_database_path(),
            poll_interval_secs: 60,
            cycle_deadline_secs: 120,
            read_timeout_ms: 2000,
            events_capacity: 100,
            fetch: FetchConfig::default(),
            normalize: NormalizeConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 500,
            max_backoff_ms: 5000,
            request_timeout_secs: 30,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            max_skipped_ratio: 0.05,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            ttl_secs: 300,
            warm_views: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from an explicit TOML file, or the platform default
    /// location when `path` is `None`. A missing default file yields defaults;
    /// a missing explicit file is `NotFound`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if !path.exists() => Err(Error::NotFound(format!(
                "Config file {}",
                path.display()
            ))),
            Some(path) => Self::from_toml_file(path),
            None => match default_config_file() {
                Some(path) if path.exists() => Self::from_toml_file(&path),
                _ => {
                    debug!("No config file found, using compiled defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Parse a TOML config file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse TOML text; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Apply `RESULTS_*` environment variables over file/default values
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var(ENV_FEED_URL) {
            self.feed_url = url;
        }
        if let Ok(path) = std::env::var(ENV_DATABASE_PATH) {
            self.database_path = PathBuf::from(path);
        }
        if let Ok(secs) = std::env::var(ENV_POLL_INTERVAL_SECS) {
            self.poll_interval_secs = secs.trim().parse().map_err(|_| {
                Error::Config(format!("{} is not a number: {}", ENV_POLL_INTERVAL_SECS, secs))
            })?;
        }
        if let Ok(url) = std::env::var(ENV_REDIS_URL) {
            self.cache.redis_url = Some(url);
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.feed_url.trim().is_empty() {
            return Err(Error::Config(
                "Feed URL not configured. Set one of:\n\
                 1. Command line: --feed-url <url>\n\
                 2. Environment: RESULTS_FEED_URL=<url>\n\
                 3. TOML config: feed_url = \"<url>\""
                    .to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(Error::Config("poll_interval_secs must be > 0".to_string()));
        }
        if self.cycle_deadline_secs == 0 {
            return Err(Error::Config("cycle_deadline_secs must be > 0".to_string()));
        }
        if self.fetch.max_attempts == 0 {
            return Err(Error::Config("fetch.max_attempts must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.normalize.max_skipped_ratio) {
            return Err(Error::Config(format!(
                "normalize.max_skipped_ratio must be within 0.0..=1.0, got {}",
                self.normalize.max_skipped_ratio
            )));
        }
        if self.cache.backend == CacheBackendKind::Redis && self.cache.redis_url.is_none() {
            return Err(Error::Config(
                "cache.backend = \"redis\" requires cache.redis_url".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write a configuration file, creating parent directories
pub fn write_toml_config(config: &ServiceConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Platform config file location (`~/.config/results-service/config.toml` on Linux)
pub fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"));
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc").join(APP_DIR).join("config.toml");
        match user_config {
            Some(path) if path.exists() => Some(path),
            _ if system_config.exists() => Some(system_config),
            other => other,
        }
    } else {
        user_config
    }
}

/// OS-dependent default database location
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("./results_data"))
        .join("results.db")
}
