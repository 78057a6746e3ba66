//! Pipeproxy Library
//!
//! Local inter-process stream forwarding proxy: accepts clients on a Unix
//! socket, tracks their connection records in a per-instance registry, and
//! relays their bytes to a configured upstream endpoint.

pub mod config;
pub mod error;
pub mod proxy;
pub mod relay;
pub mod service;
pub mod shutdown;

pub use config::Config;
pub use error::{CoreResult, ProxyError};
pub use proxy::{ConnectionHandle, ConnectionRegistry, ProxyInstance, ProxyPaths};
pub use service::ProxyService;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the application layers of the proxy
pub type Result<T> = anyhow::Result<T>;
