//! Error handling module
//!
//! Defines the error type shared by the proxy core and the typed result
//! alias used at the core boundaries. Application layers wrap these in
//! `anyhow` for context.

use std::io;
use thiserror::Error;

/// Pipeproxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Storage for an instance or a connection record could not be reserved
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// An auxiliary runtime resource (such as the connect-completion
    /// signal) could not be created
    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    /// IO error from the listener or a forwarded stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for core operations carrying a [`ProxyError`].
pub type CoreResult<T> = std::result::Result<T, ProxyError>;
