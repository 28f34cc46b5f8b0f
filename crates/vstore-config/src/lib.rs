//! # vstore-config
//!
//! Configuration for vstore.
//!
//! Loads configuration from:
//! 1. `~/.vstore/config.toml` (global)
//! 2. `.vstore/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)
//!
//! The loaded [`Config`] is passed explicitly to whoever builds the backing
//! store; there is no process-wide instance.

pub mod logging;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ENV_CACHE_DIR: &str = "VSTORE_CACHE_DIR";
pub const ENV_FETCH_TIMEOUT_MS: &str = "VSTORE_FETCH_TIMEOUT_MS";
pub const ENV_BACKEND_ORDER: &str = "VSTORE_BACKEND_ORDER";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Remote backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Legacy version-control server.
    Legacy,
    /// Distributed source-control service.
    Distributed,
    /// Content-addressable remote-execution cache.
    Recas,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Distributed,
        BackendKind::Legacy,
        BackendKind::Recas,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Legacy => "legacy",
            BackendKind::Distributed => "distributed",
            BackendKind::Recas => "recas",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "legacy" => Ok(BackendKind::Legacy),
            "distributed" => Ok(BackendKind::Distributed),
            "recas" => Ok(BackendKind::Recas),
            other => Err(ConfigError::Invalid(format!("unknown backend {:?}", other))),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
    pub popularity: PopularityConfig,
    pub backends: BackendsConfig,
}

impl Config {
    /// Load config from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Path::new(".vstore/config.toml");
        let mut config = Self::load_from(global.as_deref(), Some(project))?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load and layer config files without consulting the environment.
    /// Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in [global, project].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let layer: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, layer);
        }
        Ok(Config::deserialize(toml::Value::Table(merged))?)
    }

    /// Parse a single TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Global config path: ~/.vstore/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vstore/config.toml"))
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_CACHE_DIR) {
            self.cache.root = PathBuf::from(dir);
        }
        if let Some(ms) = lookup(ENV_FETCH_TIMEOUT_MS) {
            self.fetch.timeout_ms = ms.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{} must be an integer, got {:?}", ENV_FETCH_TIMEOUT_MS, ms))
            })?;
        }
        if let Some(order) = lookup(ENV_BACKEND_ORDER) {
            self.fetch.order = order
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(BackendKind::from_str)
                .collect::<Result<_, _>>()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch.timeout_ms == 0 {
            return Err(ConfigError::Invalid("fetch.timeout_ms must be > 0".into()));
        }
        if self.fetch.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("fetch.retry.max_attempts must be >= 1".into()));
        }
        if self.fetch.max_concurrent_prefetch == 0 {
            return Err(ConfigError::Invalid("fetch.max_concurrent_prefetch must be >= 1".into()));
        }
        let mut seen = Vec::new();
        for kind in &self.fetch.order {
            if seen.contains(kind) {
                return Err(ConfigError::Invalid(format!("backend {} listed twice in fetch.order", kind)));
            }
            seen.push(*kind);
        }
        if let Some(pinned) = self.popularity.pinned_backend {
            if !self.fetch.order.contains(&pinned) {
                return Err(ConfigError::Invalid(format!(
                    "popularity.pinned_backend {} is not in fetch.order",
                    pinned
                )));
            }
        }
        if self.popularity.enabled && self.popularity.threshold == 0 {
            return Err(ConfigError::Invalid("popularity.threshold must be >= 1".into()));
        }
        Ok(())
    }

    /// Backends in fallback order that also have an endpoint configured.
    pub fn active_backends(&self) -> Vec<BackendKind> {
        self.fetch
            .order
            .iter()
            .copied()
            .filter(|kind| self.backends.is_configured(*kind))
            .collect()
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Recursively overlay `overlay` onto `base`; scalar and array values replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Local cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// On-disk cache root
    pub root: PathBuf,
    /// Keep objects in memory only (nothing written to `root`)
    pub ephemeral: bool,
    /// Size budget enforced by `prune`
    pub max_bytes: Option<u64>,
    /// Rehash blob/tree records when reading them back
    pub verify_on_read: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".vstore/cache"),
            ephemeral: false,
            max_bytes: None,
            verify_on_read: false,
        }
    }
}

/// Fetch coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Fallback order across backends
    pub order: Vec<BackendKind>,
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Rehash fetched objects and reject mismatches
    pub verify_content: bool,
    /// Upper bound on concurrent fetches issued by one prefetch call
    pub max_concurrent_prefetch: usize,
    pub retry: RetryConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            order: BackendKind::ALL.to_vec(),
            timeout_ms: 30_000,
            verify_content: false,
            max_concurrent_prefetch: 16,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry of a single backend on transient failure, with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per backend, including the first (1 = no retry)
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Routing skew for frequently requested objects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PopularityConfig {
    pub enabled: bool,
    /// Length of the counting window
    pub window_secs: u64,
    /// Requests within one window that make a key popular
    pub threshold: u32,
    /// Backend tried first for popular keys
    pub pinned_backend: Option<BackendKind>,
    /// Keys tracked at once; the table is cleared of stale windows past this
    pub max_tracked: usize,
}

impl Default for PopularityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_secs: 60,
            threshold: 8,
            pinned_backend: None,
            max_tracked: 100_000,
        }
    }
}

/// Endpoints of the remote backends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub legacy: Option<EndpointConfig>,
    pub distributed: Option<EndpointConfig>,
    pub recas: Option<RecasConfig>,
}

impl BackendsConfig {
    pub fn is_configured(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Legacy => self.legacy.is_some(),
            BackendKind::Distributed => self.distributed.is_some(),
            BackendKind::Recas => self.recas.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// `host:port`
    pub endpoint: String,
    /// Largest response frame accepted
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecasConfig {
    /// `host:port`
    pub endpoint: String,
    /// Instance name for multi-tenant caches
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: u32,
}

fn default_instance_name() -> String {
    "default".to_string()
}

fn default_max_frame_bytes() -> u32 {
    256 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.fetch.order.len(), 3);
        assert_eq!(config.fetch.retry.max_attempts, 1);
        assert!(!config.popularity.enabled);
        assert!(config.validate().is_ok());
        // No endpoints configured, so nothing is active.
        assert!(config.active_backends().is_empty());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[fetch]"));
        assert!(toml_str.contains("[popularity]"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.fetch, Config::default().fetch);
    }

    #[test]
    fn test_active_backends_follow_order() {
        let config = Config::from_toml_str(
            r#"
[fetch]
order = ["recas", "legacy", "distributed"]

[backends.legacy]
endpoint = "hg.example.com:7000"

[backends.recas]
endpoint = "cas.example.com:8980"
instance_name = "main"
"#,
        )
        .unwrap();
        assert_eq!(
            config.active_backends(),
            vec![BackendKind::Recas, BackendKind::Legacy]
        );
        let recas = config.backends.recas.unwrap();
        assert_eq!(recas.instance_name, "main");
        assert_eq!(recas.max_frame_bytes, default_max_frame_bytes());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let err = Config::from_toml_str("[fetch]\norder = [\"svn\"]\n");
        assert!(matches!(err, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_validation() {
        let dup = Config::from_toml_str("[fetch]\norder = [\"legacy\", \"legacy\"]\n");
        assert!(matches!(dup, Err(ConfigError::Invalid(_))));

        let zero = Config::from_toml_str("[fetch]\ntimeout_ms = 0\n");
        assert!(matches!(zero, Err(ConfigError::Invalid(_))));

        let pinned = Config::from_toml_str(
            "[fetch]\norder = [\"legacy\"]\n[popularity]\npinned_backend = \"recas\"\n",
        );
        assert!(matches!(pinned, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| match key {
                ENV_CACHE_DIR => Some("/var/cache/vstore".to_string()),
                ENV_FETCH_TIMEOUT_MS => Some("250".to_string()),
                ENV_BACKEND_ORDER => Some("legacy, recas".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.cache.root, PathBuf::from("/var/cache/vstore"));
        assert_eq!(config.fetch.timeout_ms, 250);
        assert_eq!(config.fetch.order, vec![BackendKind::Legacy, BackendKind::Recas]);

        let bad = config.apply_env_overrides(|key| {
            (key == ENV_FETCH_TIMEOUT_MS).then(|| "soon".to_string())
        });
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table =
            toml::from_str("[fetch]\ntimeout_ms = 10\nverify_content = true\n").unwrap();
        let overlay: toml::Table = toml::from_str("[fetch]\ntimeout_ms = 20\n").unwrap();
        merge_tables(&mut base, overlay);
        let fetch = base["fetch"].as_table().unwrap();
        assert_eq!(fetch["timeout_ms"].as_integer(), Some(20));
        assert_eq!(fetch["verify_content"].as_bool(), Some(true));
    }
}
