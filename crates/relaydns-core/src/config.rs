use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent in-flight queries on the UDP frontend.
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            query_limit: default_query_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Size of the backing region in bytes; rounded up to a multiple
    /// of 8, must end up at least 102_400.
    #[serde(default = "default_cache_size")]
    pub size: i32,
    /// Backing file; required unless `memory_only`.
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub memory_only: bool,
    /// Rebind to an existing compatible cache file instead of zeroing it.
    #[serde(default = "default_true")]
    pub reload: bool,
    /// Recreate the cache file when its header is incompatible.
    #[serde(default)]
    pub overwrite: bool,
    /// Serve entries past their TTL and skip the expiry sweep.
    #[serde(default)]
    pub ignore_ttl: bool,
    /// -1 keeps record TTLs; >= 0 caches everything with this fixed TTL.
    #[serde(default = "default_override_ttl")]
    pub override_ttl: i64,
    /// Multiplier applied to record TTLs; must be >= 1.
    #[serde(default = "default_multiple_ttl")]
    pub multiple_ttl: i64,
    /// Cache every reply of a parallel fan-out and reconcile TTLs.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub control: Vec<CacheControlEntry>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            size: default_cache_size(),
            file: None,
            memory_only: false,
            reload: true,
            overwrite: false,
            ignore_ttl: false,
            override_ttl: default_override_ttl(),
            multiple_ttl: default_multiple_ttl(),
            parallel: false,
            control: Vec::new(),
        }
    }
}

/// One TTL policy rule, matched against query and record names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheControlEntry {
    /// Domain pattern; `*` and `?` wildcards.
    pub pattern: String,
    pub state: TtlState,
    #[serde(default = "default_coefficient")]
    pub coefficient: u32,
    #[serde(default)]
    pub increment: u32,
    #[serde(default)]
    pub infection: Infection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TtlState {
    /// Never cache matching records.
    NoCache,
    /// Keep the record's own TTL.
    Original,
    /// `coefficient * ttl + increment`.
    Variable,
    /// `increment` regardless of the record's TTL.
    Fixed,
}

/// How a question-level policy spreads onto the records of a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Infection {
    /// The question policy overrides every record's own policy.
    Aggressive,
    /// Per-record policy when one matches, otherwise the question's.
    Passive,
    /// Always per-record policy.
    #[default]
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream DNS servers, `host` or `host:port` (default port 53).
    pub servers: Vec<String>,
    /// Fan a query out to every upstream instead of one in rotation.
    #[serde(default)]
    pub parallel: bool,
    /// SOCKS5 proxies, `host` or `host:port` (default port 1080).
    #[serde(default)]
    pub socks_proxies: Vec<String>,
    /// Idle keep-alive ceiling for parked upstream sockets.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_listen() -> String {
    "0.0.0.0:53".to_string()
}
fn default_query_limit() -> usize {
    10_000
}
fn default_cache_size() -> i32 {
    1_048_576
}
fn default_override_ttl() -> i64 {
    -1
}
fn default_multiple_ttl() -> i64 {
    1
}
fn default_coefficient() -> u32 {
    1
}
fn default_keep_alive() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::Error::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }
}
