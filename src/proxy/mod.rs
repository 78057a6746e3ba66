//! Proxy Core Module
//!
//! Instance lifecycle, the registry of live connection records, and the
//! connect-completion signal.

pub mod instance;
pub mod registry;
pub mod signal;

pub use instance::{ConnectionStats, InstanceId, ProxyInstance, ProxyPaths};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use signal::{ConnectSignal, ConnectWatch};
