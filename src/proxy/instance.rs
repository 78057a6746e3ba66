//! Proxy instance lifecycle.
//!
//! A [`ProxyInstance`] bundles everything one forwarding proxy owns: the
//! endpoint pair it forwards between, the registry of live connection
//! records, the connect-completion signal, and a subscription to the exit
//! signal whose sender stays with the caller. The instance is owned by a
//! single task; every mutation goes through `&mut self` and nothing here is
//! synchronized.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::broadcast;
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::config::Endpoint;
use crate::error::{CoreResult, ProxyError};
use crate::proxy::registry::{ConnectionHandle, ConnectionRegistry, OrderedIter};
use crate::proxy::signal::ConnectSignal;

/// Identifier tagging every log line emitted on behalf of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(Uuid);

impl InstanceId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proxy-{}", self.0.as_simple())
    }
}

/// Endpoint pair a proxy instance forwards between.
///
/// The instance stores its own copy; callers keep theirs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPaths {
    /// Filesystem path of the listening socket clients connect to.
    pub listen: PathBuf,
    /// Endpoint accepted client streams are forwarded to.
    pub upstream: Endpoint,
}

impl fmt::Display for ProxyPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.listen.display(), self.upstream)
    }
}

/// Connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub peak_connections: usize,
    pub total_connections_served: u64,
    pub max_connections_allowed: usize,
}

/// One forwarding proxy: its endpoints, its live connections, and its
/// signals.
///
/// `P` is the per-connection payload stored on behalf of the forwarding
/// layer. The instance never inspects it; it is created when a connection is
/// admitted and dropped when the record is released.
pub struct ProxyInstance<P> {
    id: InstanceId,
    paths: ProxyPaths,
    exit: broadcast::Receiver<()>,
    connect_signal: ConnectSignal,
    registry: ConnectionRegistry<P>,
    total_served: u64,
    peak_connections: usize,
}

impl<P> ProxyInstance<P> {
    /// Creates an instance forwarding between the given endpoints, holding at
    /// most `max_connections` live connection records.
    ///
    /// `exit_signal` is a subscription to the caller's shutdown broadcast;
    /// the sender stays with the caller and the instance never signals or
    /// closes it.
    pub fn create(
        paths: ProxyPaths,
        max_connections: usize,
        exit_signal: broadcast::Receiver<()>,
    ) -> CoreResult<Self> {
        Self::create_with_signal(paths, max_connections, exit_signal, || {
            Ok(ConnectSignal::new())
        })
    }

    /// Creation seam taking the connect-signal constructor, so signal
    /// failures can be exercised. Everything built before a failing step is
    /// dropped before the error propagates.
    fn create_with_signal<F>(
        paths: ProxyPaths,
        max_connections: usize,
        exit_signal: broadcast::Receiver<()>,
        make_signal: F,
    ) -> CoreResult<Self>
    where
        F: FnOnce() -> CoreResult<ConnectSignal>,
    {
        let id = InstanceId::generate();
        trace!("Creating proxy instance {} ({})", id, paths);

        let registry = match ConnectionRegistry::with_capacity(max_connections) {
            Ok(registry) => registry,
            Err(e) => {
                error!("Could not allocate connection registry for {}: {}", id, e);
                return Err(e);
            }
        };

        let connect_signal = match make_signal() {
            Ok(signal) => signal,
            Err(e) => {
                error!("Could not create connect-completion signal for {}: {}", id, e);
                return Err(e);
            }
        };

        trace!("Created proxy instance {} (capacity {})", id, max_connections);
        Ok(Self {
            id,
            paths,
            exit: exit_signal,
            connect_signal,
            registry,
            total_served: 0,
            peak_connections: 0,
        })
    }

    /// Tears the instance down, releasing any connection records still live
    /// in allocation order, then the connect signal and the instance itself.
    ///
    /// The exit signal is untouched; its sender belongs to the caller.
    pub fn destroy(mut self) {
        trace!("Destroying proxy instance {}", self.id);
        #[cfg(debug_assertions)]
        self.registry.assert_invariants();

        let released = self.registry.drain_for_teardown();
        if released > 0 {
            debug!(
                "Released {} connection records still live at teardown of {}",
                released, self.id
            );
        }
        trace!("Destroyed proxy instance {}", self.id);
    }

    /// Registers a new connection, appending its record behind the current
    /// tail of the order chain.
    pub fn allocate_connection(&mut self, payload: P) -> CoreResult<ConnectionHandle> {
        self.allocate_connection_with(|_| payload)
    }

    /// Registers a new connection with a payload built from its assigned
    /// handle. The builder is never run when the registry is at capacity.
    pub fn allocate_connection_with<F>(&mut self, build: F) -> CoreResult<ConnectionHandle>
    where
        F: FnOnce(ConnectionHandle) -> P,
    {
        trace!("Allocating connection record on {}", self.id);
        let handle = match self.registry.allocate_with(build) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Could not allocate connection record on {}: {}", self.id, e);
                return Err(e);
            }
        };
        self.total_served += 1;
        self.peak_connections = self.peak_connections.max(self.registry.len());
        trace!(
            "Allocated {} on {} ({} active)",
            handle,
            self.id,
            self.registry.len()
        );
        Ok(handle)
    }

    /// Releases the record for a finished connection, dropping its payload.
    /// The record's neighbors in the order chain are relinked around it.
    ///
    /// # Panics
    ///
    /// Panics if the handle does not identify a live record of this
    /// instance. Handles are single-use by contract.
    pub fn deallocate_connection(&mut self, handle: ConnectionHandle) {
        trace!("Deallocating {} on {}", handle, self.id);
        drop(self.registry.deallocate(handle));
        trace!(
            "Deallocated {} on {} ({} active)",
            handle,
            self.id,
            self.registry.len()
        );
    }

    /// Payload of a live connection, or `None` if the handle is stale.
    pub fn connection(&self, handle: ConnectionHandle) -> Option<&P> {
        self.registry.get(handle)
    }

    /// Mutable payload of a live connection, or `None` if the handle is
    /// stale.
    pub fn connection_mut(&mut self, handle: ConnectionHandle) -> Option<&mut P> {
        self.registry.get_mut(handle)
    }

    /// Iterates over live connections in allocation order.
    pub fn connections(&self) -> OrderedIter<'_, P> {
        self.registry.iter()
    }

    /// Number of live connection records.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Connect-completion signal of this instance.
    pub fn connect_signal(&self) -> &ConnectSignal {
        &self.connect_signal
    }

    /// Fresh subscription to the exit signal the instance was created with.
    ///
    /// Only exit signals sent after this call are observed.
    pub fn exit_signal(&self) -> broadcast::Receiver<()> {
        self.exit.resubscribe()
    }

    /// Endpoint pair this instance forwards between.
    pub fn paths(&self) -> &ProxyPaths {
        &self.paths
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.registry.len(),
            peak_connections: self.peak_connections,
            total_connections_served: self.total_served,
            max_connections_allowed: self.registry.capacity(),
        }
    }
}
