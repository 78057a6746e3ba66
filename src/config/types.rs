//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub monitoring: MonitoringConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Filesystem path of the listening socket clients connect to.
    pub listen_path: PathBuf,
    /// Endpoint accepted client streams are forwarded to.
    pub upstream: Endpoint,
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// A forwarding destination, either a Unix socket path or a TCP address.
///
/// Written in config files and on the command line as a single string:
/// anything that parses as a socket address (such as `127.0.0.1:9000`) is
/// TCP, everything else is taken as a Unix socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            anyhow::bail!("endpoint must not be empty");
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Tcp(addr));
        }
        Ok(Endpoint::Unix(PathBuf::from(s)))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_path: PathBuf::from("/tmp/pipeproxy.sock"),
                upstream: Endpoint::Unix(PathBuf::from("/tmp/pipeproxy-upstream.sock")),
                max_connections: 1000,
                relay_timeout: Duration::from_secs(300),
                shutdown_timeout: Duration::from_secs(30),
            },
            monitoring: MonitoringConfig {
                log_level: "info".to_string(),
                stats_interval: Duration::from_secs(60),
            },
        }
    }
}
