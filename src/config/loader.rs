use std::path::Path;

use super::{AppConfig, ConfigError};

/// Parse a YAML configuration file without cross-field validation.
///
/// Callers that adjust the result (CLI overrides) validate afterwards.
pub fn read_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }

    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Load configuration from a YAML file and validate it
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let config = read_config(path)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BalanceKind;
    use crate::config::HealthCheckMode;
    use crate::membership::SourceKind;
    use crate::registry::RegistryBackend;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_missing_config() {
        let result = load_config("/nonexistent/config.yaml");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let (_dir, path) = write_config("invalid: yaml: content: [");

        let result = load_config(&path);
        assert!(matches!(result.unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_config_valid() {
        let (_dir, path) = write_config(
            r#"
server:
  port: 2002
  host: "0.0.0.0"

proxy:
  strip_prefix: "/api"
  timeout_seconds: 10
  fallback_backend: "http://127.0.0.1:2003/base"
  hash_header: "X-User-Id"

balancer:
  strategy: weight_round_robin
  degrade_on_error: true

membership:
  source: health_check
  servers:
    - "127.0.0.1:2003,4"
    - "127.0.0.1:2004,1"
  health_check:
    mode: http
    path: "/ping"
    interval_seconds: 3

registry:
  backend: zookeeper
  hosts: ["127.0.0.1:2181"]
  register_self: "127.0.0.1:2002"
  verbose: true
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 2002);
        assert_eq!(config.proxy.strip_prefix.as_deref(), Some("/api"));
        assert_eq!(config.proxy.timeout_seconds, 10);
        assert_eq!(config.proxy.hash_header.as_deref(), Some("X-User-Id"));
        assert_eq!(config.balancer.strategy, BalanceKind::WeightRoundRobin);
        assert!(config.balancer.degrade_on_error);
        assert_eq!(config.membership.source, SourceKind::HealthCheck);
        assert_eq!(config.membership.servers.len(), 2);
        assert_eq!(config.membership.health_check.mode, HealthCheckMode::Http);
        assert_eq!(config.membership.health_check.path, "/ping");
        assert_eq!(config.membership.health_check.failure_threshold, 2);
        assert_eq!(config.registry.backend, RegistryBackend::Zookeeper);
        assert_eq!(config.registry.register_self.as_deref(), Some("127.0.0.1:2002"));
        assert!(config.registry.verbose);
        assert_eq!(config.registry.watch_timeout_seconds, 30);
    }

    #[test]
    fn test_load_config_minimal() {
        // Only the server section is required
        let (_dir, path) = write_config(
            r#"
server:
  port: 8066
  host: "127.0.0.1"
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.balancer.strategy, BalanceKind::RoundRobin);
        assert_eq!(config.membership.source, SourceKind::Static);
        assert_eq!(config.membership.servers.len(), 2);
        assert_eq!(config.proxy.max_body_bytes, 10 * 1024 * 1024);
        assert_eq!(config.registry.path_prefix, "/gateway_servers");
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let (_dir, path) = write_config(
            r#"
server:
  port: 2002
  host: "127.0.0.1"
balancer:
  strategy: consistent_hash
  replicas: 0
"#,
        );

        assert!(matches!(load_config(&path).unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_read_config_defers_validation() {
        let (_dir, path) = write_config(
            r#"
server:
  port: 2002
  host: "127.0.0.1"
balancer:
  strategy: weight_round_robin
membership:
  servers: ["127.0.0.1:2003", "127.0.0.1:2004"]
"#,
        );

        assert!(matches!(load_config(&path).unwrap_err(), ConfigError::Validation(_)));

        let mut config = read_config(&path).unwrap();
        assert!(config.validate().is_err());
        config.balancer.strategy = BalanceKind::RoundRobin;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_missing_config() {
        assert!(matches!(read_config("/nonexistent/config.yaml").unwrap_err(), ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_config_unknown_strategy() {
        let (_dir, path) = write_config(
            r#"
server:
  port: 2002
  host: "127.0.0.1"
balancer:
  strategy: least_connections
"#,
        );

        assert!(matches!(load_config(&path).unwrap_err(), ConfigError::Parse(_)));
    }

    #[test]
    fn test_config_from_file() {
        let result = AppConfig::from_file("/nonexistent/path.yaml");
        assert!(result.is_err());
    }
}
