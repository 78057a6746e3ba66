//! Relay Session

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::Endpoint;
use crate::proxy::ConnectionHandle;

/// Bookkeeping for one pumped connection.
///
/// Owned exclusively by the pump task moving the connection's bytes; the
/// counters are plain fields, not shared state.
#[derive(Debug)]
pub struct RelaySession {
    handle: ConnectionHandle,
    upstream: Endpoint,
    start_time: Instant,
    bytes_up: u64,
    bytes_down: u64,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(handle: ConnectionHandle, upstream: Endpoint) -> Self {
        debug!("Starting relay session for {} (-> {})", handle, upstream);

        Self {
            handle,
            upstream,
            start_time: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
        }
    }

    /// Handle of the connection record this session pumps for.
    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    /// Get bytes transferred upstream (client to upstream)
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up
    }

    /// Get bytes transferred downstream (upstream to client)
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down
    }

    /// Get total bytes transferred
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Get session duration
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record the final transfer totals
    pub fn record_transfer(&mut self, bytes_up: u64, bytes_down: u64) {
        self.bytes_up = bytes_up;
        self.bytes_down = bytes_down;
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        let duration = self.duration();

        info!(
            conn = %self.handle,
            upstream = %self.upstream,
            duration_ms = duration.as_millis(),
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            total_bytes = self.total_bytes(),
            "Relay session finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ConnectionRegistry;
    use std::path::PathBuf;

    fn test_handle() -> ConnectionHandle {
        let mut registry = ConnectionRegistry::with_capacity(1).unwrap();
        registry.allocate(()).unwrap()
    }

    #[test]
    fn starts_with_zero_counters() {
        let session = RelaySession::new(
            test_handle(),
            Endpoint::Unix(PathBuf::from("/tmp/up.sock")),
        );
        assert_eq!(session.bytes_up(), 0);
        assert_eq!(session.bytes_down(), 0);
        assert_eq!(session.total_bytes(), 0);
    }

    #[test]
    fn record_transfer_sets_totals() {
        let mut session = RelaySession::new(
            test_handle(),
            Endpoint::Tcp("127.0.0.1:9000".parse().unwrap()),
        );
        session.record_transfer(10, 32);
        assert_eq!(session.bytes_up(), 10);
        assert_eq!(session.bytes_down(), 32);
        assert_eq!(session.total_bytes(), 42);
    }
}
