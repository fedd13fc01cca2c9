//! Application configuration
//!
//! Centralized configuration management using the `config` crate.
//! Values come from optional `config/default.toml`, `config/{RUN_MODE}.toml`
//! and `ACCURATE__SECTION__KEY` environment variables, in that order.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

/// Main application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cdrs: CdrsConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub users: UsersConfig,
    #[serde(default)]
    pub freeswitch: FreeswitchConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// HTTP server configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2080
}

fn default_workers() -> usize {
    num_cpus::get()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
        }
    }
}

/// Engine wide defaults
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_tenant")]
    pub default_tenant: String,

    #[serde(default = "default_category")]
    pub default_category: String,

    #[serde(default = "default_request_type")]
    pub default_request_type: String,

    /// Decimals kept when rounding costs
    #[serde(default = "default_rounding_decimals")]
    pub rounding_decimals: u32,

    /// TTL of deduplicated RPC replies, seconds (0 disables)
    #[serde(default = "default_response_cache_ttl")]
    pub response_cache_ttl_secs: u64,

    /// Shortest prefix tried during destination matching
    #[serde(default = "default_min_prefix_len")]
    pub min_prefix_len: usize,

    /// Guardian observational timeout in milliseconds (0 = wait forever)
    #[serde(default)]
    pub lock_timeout_ms: u64,

    /// When set, the max-cost disconnect strategy also cuts real debits,
    /// not only dry-run authorizations
    #[serde(default)]
    pub max_cost_disconnect_always: bool,

    /// Instance identifier reported by `Responder.Status`
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Attempts of outbound action posts (`*call_url`)
    #[serde(default = "default_http_attempts")]
    pub http_poster_attempts: u32,

    /// Directory receiving action posts that could not be delivered
    #[serde(default = "default_fallback_path")]
    pub http_failed_dir: String,

    /// Timeout of outbound HTTP requests, seconds
    #[serde(default = "default_reply_timeout")]
    pub reply_timeout_secs: u64,

    /// Usage assumed when authorizing an event without one, seconds
    #[serde(default = "default_max_call_duration")]
    pub max_call_duration_secs: u64,
}

fn default_tenant() -> String {
    "cgrates.org".to_string()
}

fn default_category() -> String {
    "call".to_string()
}

fn default_request_type() -> String {
    "*rated".to_string()
}

fn default_rounding_decimals() -> u32 {
    10
}

fn default_response_cache_ttl() -> u64 {
    10
}

fn default_min_prefix_len() -> usize {
    1
}

fn default_node_id() -> String {
    "accurate".to_string()
}

fn default_http_attempts() -> u32 {
    3
}

fn default_reply_timeout() -> u64 {
    2
}

fn default_max_call_duration() -> u64 {
    3 * 3600
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant(),
            default_category: default_category(),
            default_request_type: default_request_type(),
            rounding_decimals: default_rounding_decimals(),
            response_cache_ttl_secs: default_response_cache_ttl(),
            min_prefix_len: default_min_prefix_len(),
            lock_timeout_ms: 0,
            max_cost_disconnect_always: false,
            node_id: default_node_id(),
            http_poster_attempts: default_http_attempts(),
            http_failed_dir: default_fallback_path(),
            reply_timeout_secs: default_reply_timeout(),
            max_call_duration_secs: default_max_call_duration(),
        }
    }
}

/// Backing stores
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// `*map` (in-process) or `*redis`
    #[serde(default = "default_storage_kind")]
    pub kind: String,

    /// Redis connection URL, used when `kind = "*redis"`
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// PostgreSQL connection URL for the CDR store; in-memory when absent
    pub cdr_db_url: Option<String>,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection acquire timeout in seconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// LRU capacity per cache prefix
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Entries kept in the load history list
    #[serde(default = "default_load_history_size")]
    pub load_history_size: usize,
}

fn default_storage_kind() -> String {
    "*map".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/10".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    30
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_load_history_size() -> usize {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: default_storage_kind(),
            redis_url: default_redis_url(),
            cdr_db_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout(),
            cache_capacity: default_cache_capacity(),
            load_history_size: default_load_history_size(),
        }
    }
}

/// CDR mediation pipeline
#[derive(Debug, Deserialize, Clone)]
pub struct CdrsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Persist raw and rated CDRs
    #[serde(default = "default_true")]
    pub store_cdrs: bool,

    /// Rate unrated CDRs through the responder
    #[serde(default = "default_true")]
    pub rals_enabled: bool,

    /// Feed CDRs into the stats queues
    #[serde(default = "default_true")]
    pub stats_enabled: bool,

    /// Attach an account summary to every rated CDR
    #[serde(default)]
    pub account_summary: bool,

    /// Name of the tax collaborator; none when empty
    #[serde(default)]
    pub tax_collaborator: String,

    /// Attempts when looking up session-manager costs for prepaid CDRs
    #[serde(default = "default_sm_cost_retries")]
    pub sm_cost_retries: u32,

    #[serde(default)]
    pub replication: Vec<ReplicationTarget>,
}

fn default_true() -> bool {
    true
}

fn default_sm_cost_retries() -> u32 {
    5
}

impl Default for CdrsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store_cdrs: true,
            rals_enabled: true,
            stats_enabled: true,
            account_summary: false,
            tax_collaborator: String::new(),
            sm_cost_retries: default_sm_cost_retries(),
            replication: Vec::new(),
        }
    }
}

/// One CDR replication destination
#[derive(Debug, Deserialize, Clone)]
pub struct ReplicationTarget {
    pub address: String,

    /// `*http_json_cdr`, `*http_json_map` or `*http_post`
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Structured query the CDR must match to be replicated
    #[serde(default)]
    pub filter: String,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default)]
    pub synchronous: bool,

    /// Directory receiving payloads that could not be delivered
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,
}

fn default_transport() -> String {
    "*http_json_cdr".to_string()
}

fn default_attempts() -> u32 {
    1
}

fn default_fallback_path() -> String {
    "/var/spool/accurate/failed_posts".to_string()
}

/// Statistics queues
#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    /// Seconds between queue persistence runs (0 disables)
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: u64,
}

fn default_save_interval() -> u64 {
    60
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            save_interval_secs: default_save_interval(),
        }
    }
}

/// User profiles
#[derive(Debug, Deserialize, Clone)]
pub struct UsersConfig {
    /// Fields profiles are indexed by
    #[serde(default)]
    pub indexes: Vec<String>,

    /// Rank every matching profile; otherwise the first match is used
    #[serde(default = "default_true")]
    pub complexity_match: bool,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            indexes: Vec::new(),
            complexity_match: true,
        }
    }
}

/// FreeSWITCH JSON CDR intake
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FreeswitchConfig {
    /// Channel variables copied into the extra fields, `~name` marks
    /// variables that may be missing without a warning
    #[serde(default)]
    pub extra_fields: Vec<String>,
}

/// Logging
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info,accurate=debug".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 2080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("storage.kind", "*map")?
            .set_default("storage.cache_capacity", 10_000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables with ACCURATE_ prefix
            .add_source(
                Environment::with_prefix("ACCURATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load configuration from a specific file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("ACCURATE").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Get the server bind address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_general_config() {
        let config = GeneralConfig::default();
        assert_eq!(config.default_tenant, "cgrates.org");
        assert_eq!(config.rounding_decimals, 10);
        assert!(!config.max_cost_disconnect_always);
    }

    #[test]
    fn test_replication_target_defaults() {
        let target: ReplicationTarget =
            serde_json::from_str(r#"{"address":"http://127.0.0.1:2080/cdr_http"}"#).unwrap();
        assert_eq!(target.transport, "*http_json_cdr");
        assert_eq!(target.attempts, 1);
    }

    #[test]
    fn test_server_addr() {
        let config = AppConfig::default();
        assert_eq!(config.server_addr(), "0.0.0.0:2080");
    }
}
