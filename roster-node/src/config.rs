use std::env::var;
use std::path::PathBuf;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::NodeError;
use crate::validation;

/// Expiry of each player-field cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub server_ttl: Duration,
    pub proxy_ttl: Duration,
    pub ip_ttl: Duration,
    pub last_online_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let hour = Duration::from_secs(60 * 60);
        Self {
            server_ttl: hour,
            proxy_ttl: hour,
            ip_ttl: hour,
            last_online_ttl: hour,
        }
    }
}

/// Settings the synchronization core needs. Built once at startup and
/// handed to the node; nothing reads configuration from globals.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub channel_prefix: String,
    pub heartbeat_interval: Duration,
    /// Seconds of store time after which a silent node counts as lagged.
    pub liveness_threshold: i64,
    /// Lag warnings are logged on every Nth liveness check.
    pub lag_warning_every: i32,
    pub sweep_interval: Duration,
    pub cache_cleanup_interval: Duration,
    pub cache: CacheConfig,
    /// A heartbeat for our own id younger than this (seconds) at startup
    /// means another instance is running with the same id.
    pub impostor_window: i64,
    /// When this file exists the impostor check is skipped once and the
    /// file is removed.
    pub crash_marker: Option<PathBuf>,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            channel_prefix: "redisbungee".to_string(),
            heartbeat_interval: Duration::from_secs(3),
            liveness_threshold: 30,
            lag_warning_every: 10,
            sweep_interval: Duration::from_secs(60),
            cache_cleanup_interval: Duration::from_secs(60),
            cache: CacheConfig::default(),
            impostor_window: 20,
            crash_marker: None,
        }
    }
}

/// Application configuration with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this proxy node in the fleet
    /// Env: NODE_ID (required)
    pub node_id: Option<String>,

    /// Env: REDIS_URL (default: "redis://127.0.0.1:6379")
    pub redis_url: String,

    /// Upper bound on concurrently checked-out store connections
    /// Env: REDIS_MAX_CONNECTIONS (default: 8)
    pub redis_max_connections: usize,

    /// Env: CHANNEL_PREFIX (default: "redisbungee")
    pub channel_prefix: String,

    /// Env: HEARTBEAT_INTERVAL_SECS (default: 3)
    pub heartbeat_interval: Duration,

    /// Env: LIVENESS_THRESHOLD_SECS (default: 30)
    pub liveness_threshold: i64,

    /// Env: LAG_WARNING_EVERY (default: 10)
    pub lag_warning_every: i32,

    /// Env: SWEEP_INTERVAL_SECS (default: 60)
    pub sweep_interval: Duration,

    /// Env: CACHE_CLEANUP_INTERVAL_SECS (default: 60)
    pub cache_cleanup_interval: Duration,

    /// Env: SERVER_CACHE_TTL_SECS, PROXY_CACHE_TTL_SECS, IP_CACHE_TTL_SECS,
    /// LAST_ONLINE_CACHE_TTL_SECS (default: 3600 each)
    pub cache: CacheConfig,

    /// Env: CRASH_MARKER_PATH (default: "restarted_from_crash.txt")
    pub crash_marker: PathBuf,

    /// Worker threads for the runtime
    /// Env: WORKER_THREADS (default: 4)
    pub worker_threads: usize,

    /// Env: PORT (default: 3000)
    pub port: u16,

    /// Request body size limit in bytes
    /// Env: REQUEST_BODY_LIMIT (default: 65536 = 64KB)
    pub request_body_limit: usize,

    /// Env: REQUEST_TIMEOUT_SECS (default: 10)
    pub request_timeout: Duration,

    /// Rate limit for lifecycle endpoints (/login, /postlogin, /switch, /disconnect)
    /// Env: RATE_LIMIT_LIFECYCLE_PER_SEC (default: 100)
    /// Lenient: a proxy restart reconnects every player at once
    pub rate_limit_lifecycle_per_sec: u64,

    /// Env: RATE_LIMIT_LIFECYCLE_BURST (default: 200)
    pub rate_limit_lifecycle_burst: u32,

    /// Rate limit for query and command endpoints
    /// Env: RATE_LIMIT_QUERY_PER_SEC (default: 20)
    pub rate_limit_query_per_sec: u64,

    /// Env: RATE_LIMIT_QUERY_BURST (default: 40)
    pub rate_limit_query_burst: u32,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let _ = dotenv();
        let defaults = Self::default();
        Self {
            node_id: var("NODE_ID").ok().filter(|id| !id.trim().is_empty()),
            redis_url: env_or_default_string("REDIS_URL", &defaults.redis_url),
            redis_max_connections: env_or_default(
                "REDIS_MAX_CONNECTIONS",
                defaults.redis_max_connections,
            ),
            channel_prefix: env_or_default_string("CHANNEL_PREFIX", &defaults.channel_prefix),
            heartbeat_interval: Duration::from_secs(env_or_default("HEARTBEAT_INTERVAL_SECS", 3)),
            liveness_threshold: env_or_default("LIVENESS_THRESHOLD_SECS", 30),
            lag_warning_every: env_or_default("LAG_WARNING_EVERY", 10),
            sweep_interval: Duration::from_secs(env_or_default("SWEEP_INTERVAL_SECS", 60)),
            cache_cleanup_interval: Duration::from_secs(env_or_default(
                "CACHE_CLEANUP_INTERVAL_SECS",
                60,
            )),
            cache: CacheConfig {
                server_ttl: Duration::from_secs(env_or_default("SERVER_CACHE_TTL_SECS", 3600)),
                proxy_ttl: Duration::from_secs(env_or_default("PROXY_CACHE_TTL_SECS", 3600)),
                ip_ttl: Duration::from_secs(env_or_default("IP_CACHE_TTL_SECS", 3600)),
                last_online_ttl: Duration::from_secs(env_or_default(
                    "LAST_ONLINE_CACHE_TTL_SECS",
                    3600,
                )),
            },
            crash_marker: PathBuf::from(env_or_default_string(
                "CRASH_MARKER_PATH",
                "restarted_from_crash.txt",
            )),
            worker_threads: env_or_default("WORKER_THREADS", defaults.worker_threads),
            port: env_or_default("PORT", defaults.port),
            request_body_limit: env_or_default("REQUEST_BODY_LIMIT", defaults.request_body_limit),
            request_timeout: Duration::from_secs(env_or_default("REQUEST_TIMEOUT_SECS", 10)),
            rate_limit_lifecycle_per_sec: env_or_default("RATE_LIMIT_LIFECYCLE_PER_SEC", 100),
            rate_limit_lifecycle_burst: env_or_default("RATE_LIMIT_LIFECYCLE_BURST", 200),
            rate_limit_query_per_sec: env_or_default("RATE_LIMIT_QUERY_PER_SEC", 20),
            rate_limit_query_burst: env_or_default("RATE_LIMIT_QUERY_BURST", 40),
        }
    }

    /// The synchronization settings, or a configuration error when the node
    /// cannot join a fleet with them.
    pub fn node_config(&self) -> Result<NodeConfig, NodeError> {
        let node_id = self
            .node_id
            .clone()
            .ok_or_else(|| NodeError::Config("NODE_ID is not set or is empty".to_string()))?;
        validation::validate_node_id(&node_id)
            .map_err(|e| NodeError::Config(format!("NODE_ID: {e}")))?;

        if self.liveness_threshold <= 0 {
            return Err(NodeError::Config(
                "LIVENESS_THRESHOLD_SECS must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero()
            || self.sweep_interval.is_zero()
            || self.cache_cleanup_interval.is_zero()
        {
            return Err(NodeError::Config("job intervals must be non-zero".to_string()));
        }

        Ok(NodeConfig {
            node_id,
            channel_prefix: self.channel_prefix.clone(),
            heartbeat_interval: self.heartbeat_interval,
            liveness_threshold: self.liveness_threshold,
            lag_warning_every: self.lag_warning_every.max(1),
            sweep_interval: self.sweep_interval,
            cache_cleanup_interval: self.cache_cleanup_interval,
            cache: self.cache.clone(),
            impostor_window: 20,
            crash_marker: Some(self.crash_marker.clone()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_max_connections: 8,
            channel_prefix: "redisbungee".to_string(),
            heartbeat_interval: Duration::from_secs(3),
            liveness_threshold: 30,
            lag_warning_every: 10,
            sweep_interval: Duration::from_secs(60),
            cache_cleanup_interval: Duration::from_secs(60),
            cache: CacheConfig::default(),
            crash_marker: PathBuf::from("restarted_from_crash.txt"),
            worker_threads: 4,
            port: 3000,
            request_body_limit: 64 * 1024,
            request_timeout: Duration::from_secs(10),
            rate_limit_lifecycle_per_sec: 100,
            rate_limit_lifecycle_burst: 200,
            rate_limit_query_per_sec: 20,
            rate_limit_query_burst: 40,
        }
    }
}

/// Parse environment variable or return default value
fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Parse environment variable string or return default value
fn env_or_default_string(key: &str, default: &str) -> String {
    var(key).unwrap_or_else(|_| default.to_string())
}
