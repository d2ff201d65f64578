//! Configuration management.
//!
//! Settings load from an optional TOML file layered under
//! `CARAVEL__`-prefixed environment variables (`CARAVEL__MASTER__ENDPOINT`
//! and so on). Durations accept humantime strings ("2s", "15m").

use serde::Deserialize;
use std::time::Duration;

/// Main scheduler configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Framework identity presented to the master
    #[serde(default)]
    pub framework: FrameworkConfig,

    /// Master endpoint and call tuning
    #[serde(default)]
    pub master: MasterConfig,

    /// Key/value store settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Leader gate settings
    #[serde(default)]
    pub leader: LeaderConfig,

    /// Admin API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Executor artifact settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrameworkConfig {
    /// Unix user tasks run as
    #[serde(default = "default_user")]
    pub user: String,

    /// Framework name registered with the master
    #[serde(default = "default_framework_name")]
    pub name: String,

    /// Resource role
    #[serde(default = "default_role")]
    pub role: String,

    /// Hostname advertised to the master
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Principal used for the master's ACLs
    #[serde(default = "default_principal")]
    pub principal: String,

    /// Whether agents checkpoint framework state
    #[serde(default = "default_checkpointing")]
    pub checkpointing: bool,

    /// How long the master keeps tasks alive after this replica disconnects
    #[serde(default = "default_failover_timeout", with = "humantime_serde")]
    pub failover_timeout: Duration,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            name: default_framework_name(),
            role: default_role(),
            hostname: default_hostname(),
            principal: default_principal(),
            checkpointing: default_checkpointing(),
            failover_timeout: default_failover_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Scheduler API endpoint, e.g. "http://127.0.0.1:5050/api/v1/scheduler"
    #[serde(default = "default_master_endpoint")]
    pub endpoint: String,

    /// Per-call request timeout
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// REVIVE token bucket size
    #[serde(default = "default_revive_burst")]
    pub revive_burst: u32,

    /// Interval at which one REVIVE token refills
    #[serde(default = "default_revive_wait", with = "humantime_serde")]
    pub revive_wait: Duration,

    /// Delay before re-subscribing after a transport failure
    #[serde(default = "default_subscribe_retry", with = "humantime_serde")]
    pub subscribe_retry: Duration,

    /// Period of the background reconciler
    #[serde(default = "default_reconcile_interval", with = "humantime_serde")]
    pub reconcile_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            endpoint: default_master_endpoint(),
            request_timeout: default_request_timeout(),
            revive_burst: default_revive_burst(),
            revive_wait: default_revive_wait(),
            subscribe_retry: default_subscribe_retry(),
            reconcile_interval: default_reconcile_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Store endpoints, comma separated (e.g. "redis://127.0.0.1:6379")
    #[serde(default = "default_storage_endpoints")]
    pub endpoints: String,

    /// Store operation timeout
    #[serde(default = "default_storage_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Sleep between attempts of a failed store mutation
    #[serde(default = "default_persistence_retry", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Return the first store failure instead of retrying forever.
    /// Only ever enabled by tests exercising failure paths.
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            endpoints: default_storage_endpoints(),
            timeout: default_storage_timeout(),
            retry_interval: default_persistence_retry(),
            fail_fast: false,
        }
    }
}

/// Address family for the leader liveness link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderConfig {
    /// Address family for the liveness listener and client
    #[serde(default)]
    pub address_family: AddressFamily,

    /// Address this replica advertises in the leader key
    #[serde(default = "default_leader_ip")]
    pub ip: String,

    /// Liveness listener port
    #[serde(default = "default_leader_port")]
    pub server_port: u16,

    /// Sleep after a failed accept before listening again
    #[serde(default = "default_leader_server_retry", with = "humantime_serde")]
    pub server_retry: Duration,

    /// Sleep between election attempts
    #[serde(default = "default_leader_retry", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Network interface the deployment binds this replica to. Carried for
    /// deployment tooling; the advertised address comes from `ip`.
    #[serde(default)]
    pub network_interface: Option<String>,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            address_family: AddressFamily::default(),
            ip: default_leader_ip(),
            server_port: default_leader_port(),
            server_retry: default_leader_server_retry(),
            retry_interval: default_leader_retry(),
            network_interface: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Admin API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// TLS certificate path; plaintext when unset
    #[serde(default)]
    pub cert: Option<String>,

    /// TLS key path
    #[serde(default)]
    pub key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            cert: None,
            key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Path of the executor binary on the artifact server
    #[serde(default = "default_executor_path")]
    pub path: String,

    /// Port of the artifact server tasks fetch the executor from
    #[serde(default = "default_executor_port")]
    pub port: u16,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            path: default_executor_path(),
            port: default_executor_port(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Whether the Prometheus recorder is installed
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

// Default value functions
fn default_user() -> String {
    "root".to_string()
}
fn default_framework_name() -> String {
    "caravel".to_string()
}
fn default_role() -> String {
    "*".to_string()
}
fn default_hostname() -> String {
    "localhost".to_string()
}
fn default_principal() -> String {
    "caravel".to_string()
}
fn default_checkpointing() -> bool {
    true
}
fn default_failover_timeout() -> Duration {
    Duration::from_secs(3600)
}
fn default_master_endpoint() -> String {
    "http://127.0.0.1:5050/api/v1/scheduler".to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(15)
}
fn default_revive_burst() -> u32 {
    3
}
fn default_revive_wait() -> Duration {
    Duration::from_secs(1)
}
fn default_subscribe_retry() -> Duration {
    Duration::from_secs(2)
}
fn default_reconcile_interval() -> Duration {
    Duration::from_secs(15 * 60)
}
fn default_storage_endpoints() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_storage_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_persistence_retry() -> Duration {
    Duration::from_secs(2)
}
fn default_leader_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_leader_port() -> u16 {
    8082
}
fn default_leader_server_retry() -> Duration {
    Duration::from_secs(2)
}
fn default_leader_retry() -> Duration {
    Duration::from_secs(2)
}
fn default_api_port() -> u16 {
    8080
}
fn default_executor_path() -> String {
    "executor".to_string()
}
fn default_executor_port() -> u16 {
    8081
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CARAVEL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a file, with environment variables taking precedence.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CARAVEL").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// The framework identity sent on SUBSCRIBE.
    pub fn framework_info(&self) -> crate::protocol::FrameworkInfo {
        crate::protocol::FrameworkInfo {
            user: self.framework.user.clone(),
            name: self.framework.name.clone(),
            id: None,
            failover_timeout: self.framework.failover_timeout.as_secs_f64(),
            checkpoint: self.framework.checkpointing,
            role: self.framework.role.clone(),
            hostname: self.framework.hostname.clone(),
            principal: self.framework.principal.clone(),
        }
    }
}
