//! Configuration Manager

use super::{Config, Endpoint};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!(
                "Configuration file not found at {}, using defaults",
                path.display()
            );
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();

        // Override with environment variables if present
        if let Ok(listen_path) = std::env::var("PIPEPROXY_LISTEN_PATH") {
            config.server.listen_path = listen_path.into();
        }

        if let Ok(upstream) = std::env::var("PIPEPROXY_UPSTREAM") {
            config.server.upstream = upstream
                .parse::<Endpoint>()
                .with_context(|| format!("Invalid PIPEPROXY_UPSTREAM: {}", upstream))?;
        }

        if let Ok(max_conn) = std::env::var("PIPEPROXY_MAX_CONNECTIONS") {
            config.server.max_connections = max_conn
                .parse::<usize>()
                .with_context(|| format!("Invalid PIPEPROXY_MAX_CONNECTIONS: {}", max_conn))?;
        }

        if let Ok(timeout) = std::env::var("PIPEPROXY_RELAY_TIMEOUT") {
            config.server.relay_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid PIPEPROXY_RELAY_TIMEOUT: {}", timeout))?;
        }

        if let Ok(log_level) = std::env::var("PIPEPROXY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    /// Validate server configuration
    fn validate_server_config(&self) -> Result<()> {
        if self.server.listen_path.as_os_str().is_empty() {
            bail!("listen_path must not be empty");
        }

        if let Endpoint::Unix(path) = &self.server.upstream {
            if path.as_os_str().is_empty() {
                bail!("upstream path must not be empty");
            }
            if *path == self.server.listen_path {
                bail!("upstream must differ from listen_path");
            }
        }

        if self.server.max_connections == 0 {
            bail!("max_connections must be greater than 0");
        }

        if self.server.max_connections > 100000 {
            bail!("max_connections cannot exceed 100,000 for safety");
        }

        if self.server.relay_timeout.as_secs() == 0 {
            bail!("relay_timeout must be greater than 0");
        }

        if self.server.relay_timeout.as_secs() > 3600 {
            bail!("relay_timeout cannot exceed 1 hour");
        }

        Ok(())
    }

    /// Validate monitoring configuration
    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!(
                "monitoring.log_level must be one of: {}",
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        listen: Option<&Path>,
        upstream: Option<&str>,
        max_connections: Option<usize>,
        relay_timeout: Option<u64>,
    ) {
        // Override listen path if provided
        if let Some(listen_path) = listen {
            self.server.listen_path = listen_path.to_path_buf();
            tracing::info!("CLI override: listen path set to {}", listen_path.display());
        }

        // Override upstream endpoint if provided
        if let Some(upstream_str) = upstream {
            match upstream_str.parse::<Endpoint>() {
                Ok(endpoint) => {
                    tracing::info!("CLI override: upstream set to {}", endpoint);
                    self.server.upstream = endpoint;
                }
                Err(e) => {
                    tracing::warn!("Invalid upstream provided: {} ({})", upstream_str, e);
                }
            }
        }

        // Override max connections if provided
        if let Some(max_conn) = max_connections {
            self.server.max_connections = max_conn;
            tracing::info!("CLI override: max connections set to {}", max_conn);
        }

        // Override relay timeout if provided
        if let Some(timeout_secs) = relay_timeout {
            self.server.relay_timeout = std::time::Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: relay timeout set to {}s", timeout_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn parses_full_toml_config() {
        let raw = r#"
            [server]
            listen_path = "/run/pipeproxy/listen.sock"
            upstream = "127.0.0.1:7700"
            max_connections = 64
            relay_timeout = "2m"
            shutdown_timeout = "10s"

            [monitoring]
            log_level = "debug"
            stats_interval = "30s"
        "#;

        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(
            config.server.listen_path,
            PathBuf::from("/run/pipeproxy/listen.sock")
        );
        assert_eq!(
            config.server.upstream,
            Endpoint::Tcp("127.0.0.1:7700".parse().unwrap())
        );
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.relay_timeout.as_secs(), 120);
        assert_eq!(config.monitoring.log_level, "debug");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_file_reads_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
                [server]
                listen_path = "/tmp/pp-listen.sock"
                upstream = "/tmp/pp-upstream.sock"
                max_connections = 16
                relay_timeout = "1m"
                shutdown_timeout = "5s"

                [monitoring]
                log_level = "info"
                stats_interval = "1m"
            "#
        )
        .unwrap();

        let config = ConfigManager::load_from_file(file.path()).unwrap();
        assert_eq!(config.server.max_connections, 16);
        assert_eq!(
            config.server.upstream,
            Endpoint::Unix(PathBuf::from("/tmp/pp-upstream.sock"))
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config =
            ConfigManager::load_from_file(Path::new("/nonexistent/pipeproxy.toml")).unwrap();
        assert_eq!(config.server.max_connections, 1000);
    }

    #[test]
    fn rejects_zero_max_connections() {
        let mut config = Config::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_upstream_equal_to_listen_path() {
        let mut config = Config::default();
        config.server.upstream = Endpoint::Unix(config.server.listen_path.clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut config = Config::default();
        config.monitoring.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_args_override_config() {
        let mut config = Config::default();
        config.merge_with_cli_args(
            Some(Path::new("/tmp/cli-listen.sock")),
            Some("127.0.0.1:9100"),
            Some(5),
            Some(42),
        );

        assert_eq!(config.server.listen_path, PathBuf::from("/tmp/cli-listen.sock"));
        assert_eq!(
            config.server.upstream,
            Endpoint::Tcp("127.0.0.1:9100".parse().unwrap())
        );
        assert_eq!(config.server.max_connections, 5);
        assert_eq!(config.server.relay_timeout.as_secs(), 42);
    }

    #[test]
    fn invalid_cli_upstream_is_ignored() {
        let mut config = Config::default();
        let original = config.server.upstream.clone();
        config.merge_with_cli_args(None, Some(""), None, None);
        assert_eq!(config.server.upstream, original);
    }
}
