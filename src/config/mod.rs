mod loader;

use serde::{Deserialize, Serialize};
use std::path::Path;

pub use loader::{load_config, read_config};

use crate::backends::{split_entry, BalanceKind};
use crate::membership::SourceKind;
use crate::registry::{group_path, RegistryBackend};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Gateway listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 2002,
            host: "127.0.0.1".to_string(),
        }
    }
}

/// Request forwarding configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Path prefix removed from inbound requests before joining with the backend path
    #[serde(default)]
    pub strip_prefix: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_proxy_timeout")]
    pub timeout_seconds: u64,
    /// Backend used when the balancer cannot pick one
    #[serde(default)]
    pub fallback_backend: Option<String>,
    /// Request header whose value becomes the balancing key instead of the client address
    #[serde(default)]
    pub hash_header: Option<String>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_proxy_timeout() -> u64 {
    25
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            strip_prefix: None,
            timeout_seconds: default_proxy_timeout(),
            fallback_backend: None,
            hash_header: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// Balancing strategy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: BalanceKind,
    /// Virtual nodes per address on the consistent hash ring
    #[serde(default = "default_replicas")]
    pub replicas: usize,
    /// Lower a backend's effective weight when forwarding to it fails
    #[serde(default)]
    pub degrade_on_error: bool,
    /// Log every membership rebuild at info level
    #[serde(default)]
    pub verbose: bool,
}

fn default_replicas() -> usize {
    10
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceKind::default(),
            replicas: default_replicas(),
            degrade_on_error: false,
            verbose: false,
        }
    }
}

/// Where the backend list comes from
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MembershipConfig {
    #[serde(default)]
    pub source: SourceKind,
    /// `address` or `address,weight` entries for the static and health-check sources
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
}

fn default_servers() -> Vec<String> {
    vec![
        "http://127.0.0.1:2003/base".to_string(),
        "http://127.0.0.1:2004/base".to_string(),
    ]
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::default(),
            servers: default_servers(),
            health_check: HealthCheckConfig::default(),
        }
    }
}

/// Check type for the health-check source
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    #[default]
    Tcp,
    Http,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub mode: HealthCheckMode,
    /// Request path for HTTP checks
    #[serde(default = "default_health_path")]
    pub path: String,
    #[serde(default = "default_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_seconds: u64,
    /// Consecutive failures before a backend is removed
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> u64 {
    5
}

fn default_health_timeout() -> u64 {
    2
}

fn default_failure_threshold() -> u32 {
    2
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            mode: HealthCheckMode::default(),
            path: default_health_path(),
            interval_seconds: default_health_interval(),
            timeout_seconds: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Coordination service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub backend: RegistryBackend,
    /// `host:port` of each registry server
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_path_prefix")]
    pub path_prefix: String,
    #[serde(default = "default_service_group")]
    pub service_group: String,
    /// Own address to register as an ephemeral member on startup
    #[serde(default)]
    pub register_self: Option<String>,
    #[serde(default = "default_ten")]
    pub session_timeout_seconds: u64,
    #[serde(default = "default_ten")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_seconds: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Delay before re-subscribing after a watch loop ends
    #[serde(default = "default_resubscribe_delay")]
    pub resubscribe_delay_ms: u64,
    /// Log every watch event and timeout at info level
    #[serde(default)]
    pub verbose: bool,
}

fn default_path_prefix() -> String {
    "/gateway_servers".to_string()
}

fn default_service_group() -> String {
    "gateway".to_string()
}

fn default_ten() -> u64 {
    10
}

fn default_reconnect_backoff() -> u64 {
    1000
}

fn default_send_timeout() -> u64 {
    5000
}

fn default_watch_timeout() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    10
}

fn default_resubscribe_delay() -> u64 {
    1000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::default(),
            hosts: Vec::new(),
            path_prefix: default_path_prefix(),
            service_group: default_service_group(),
            register_self: None,
            session_timeout_seconds: default_ten(),
            connect_timeout_seconds: default_ten(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            send_timeout_ms: default_send_timeout(),
            watch_timeout_seconds: default_watch_timeout(),
            channel_capacity: default_channel_capacity(),
            resubscribe_delay_ms: default_resubscribe_delay(),
            verbose: false,
        }
    }
}

impl RegistryConfig {
    /// Durable node holding this gateway's service group
    pub fn group_path(&self) -> String {
        group_path(&self.path_prefix, &self.service_group)
    }
}

impl AppConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        load_config(path)
    }

    /// Load configuration with fallback to default path
    pub fn load_or_default(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        match config_path {
            Some(path) => Self::from_file(path),
            None => {
                // Try default locations
                let default_paths = ["config.yaml", "config.yml", "./config/config.yaml"];
                for p in default_paths {
                    let path = Path::new(p);
                    if path.exists() {
                        return Self::from_file(path);
                    }
                }
                Err(ConfigError::NotFound(
                    "No config file found. Tried: config.yaml, config.yml, ./config/config.yaml"
                        .to_string(),
                ))
            }
        }
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let needs_servers = matches!(
            self.membership.source,
            SourceKind::Static | SourceKind::HealthCheck
        );
        if needs_servers && self.membership.servers.is_empty() {
            return Err(ConfigError::Validation(
                "membership.servers must not be empty for static and health_check sources"
                    .to_string(),
            ));
        }

        if needs_servers && self.balancer.strategy.requires_weight() {
            for entry in &self.membership.servers {
                let parts = split_entry(entry);
                let weighted = parts.len() == 2 && parts[1].parse::<i64>().is_ok();
                if !weighted {
                    return Err(ConfigError::Validation(format!(
                        "strategy '{}' needs 'address,weight' entries, got '{}'",
                        self.balancer.strategy, entry
                    )));
                }
            }
        }

        if self.balancer.replicas == 0 {
            return Err(ConfigError::Validation(
                "balancer.replicas must be at least 1".to_string(),
            ));
        }

        if self.registry.backend == RegistryBackend::Zookeeper && self.registry.hosts.is_empty() {
            return Err(ConfigError::Validation(
                "registry.hosts must list at least one server for the zookeeper backend".to_string(),
            ));
        }

        if self.registry.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "registry.channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.membership.health_check.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "membership.health_check.failure_threshold must be at least 1".to_string(),
            ));
        }

        if self.membership.health_check.interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "membership.health_check.interval_seconds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether this process needs a registry session
    pub fn uses_registry(&self) -> bool {
        self.membership.source == SourceKind::Registry || self.registry.register_self.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}
