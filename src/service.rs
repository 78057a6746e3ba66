//! Proxy Service
//!
//! The accept loop. One task owns the proxy instance and drives every
//! lifecycle operation on it: it admits connections from the listening
//! socket, releases their records when the pump reports completion, and
//! tears the instance down on exit. Pump tasks never touch the registry;
//! their completion notices come back over a channel.

use std::time::Instant;

use anyhow::Context;
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::proxy::{ProxyInstance, ProxyPaths};
use crate::relay::{pump, PumpDone, PumpOutcome};
use crate::Result;

/// Per-connection record kept in the instance registry.
///
/// Dropping the record aborts a pump that is still running, so the bulk
/// sweep at teardown also reclaims connections that never finished.
struct ConnEntry {
    accepted_at: Instant,
    pump: Option<JoinHandle<()>>,
}

impl ConnEntry {
    fn new() -> Self {
        Self {
            accepted_at: Instant::now(),
            pump: None,
        }
    }

    fn attach(&mut self, pump: JoinHandle<()>) {
        self.pump = Some(pump);
    }
}

impl Drop for ConnEntry {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Accept loop for one forwarding proxy.
pub struct ProxyService {
    config: Config,
    exit: broadcast::Receiver<()>,
}

impl ProxyService {
    /// Creates a service from a validated configuration and a subscription
    /// to the caller's exit signal.
    pub fn new(config: Config, exit: broadcast::Receiver<()>) -> Self {
        Self { config, exit }
    }

    /// Binds the listening socket and runs the accept loop until the exit
    /// signal arrives, then drains and destroys the instance.
    pub async fn run(mut self) -> Result<()> {
        let paths = ProxyPaths {
            listen: self.config.server.listen_path.clone(),
            upstream: self.config.server.upstream.clone(),
        };
        let mut instance: ProxyInstance<ConnEntry> = ProxyInstance::create(
            paths,
            self.config.server.max_connections,
            self.exit.resubscribe(),
        )
        .with_context(|| "Failed to create proxy instance")?;

        // A leftover socket file from a previous run would make bind fail.
        match std::fs::remove_file(&self.config.server.listen_path) {
            Ok(()) => debug!(
                "Removed stale socket file {}",
                self.config.server.listen_path.display()
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                instance.destroy();
                return Err(e).with_context(|| {
                    format!(
                        "Failed to remove stale socket file {}",
                        self.config.server.listen_path.display()
                    )
                });
            }
        }

        info!(
            "Binding Unix listener to {}",
            self.config.server.listen_path.display()
        );
        let listener = match UnixListener::bind(&self.config.server.listen_path) {
            Ok(listener) => listener,
            Err(e) => {
                instance.destroy();
                return Err(e).with_context(|| {
                    format!(
                        "Failed to bind {}",
                        self.config.server.listen_path.display()
                    )
                });
            }
        };
        info!(
            instance = %instance.id(),
            "Proxy started, forwarding {}",
            instance.paths()
        );

        let (done_tx, mut done_rx) = mpsc::channel(self.config.server.max_connections.max(1));
        let mut stats_interval = tokio::time::interval(self.config.monitoring.stats_interval);
        stats_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        stats_interval.reset();

        loop {
            // Exit first: when cancellation and a completed accept race,
            // shutdown wins and the connection is swept by teardown.
            tokio::select! {
                biased;

                _ = self.exit.recv() => {
                    info!(instance = %instance.id(), "Exit signal received, stopping acceptance");
                    break;
                }

                Some(done) = done_rx.recv() => {
                    Self::finish_connection(&mut instance, done);
                }

                _ = stats_interval.tick() => {
                    let stats = instance.stats();
                    info!(
                        instance = %instance.id(),
                        active = stats.active_connections,
                        peak = stats.peak_connections,
                        served = stats.total_connections_served,
                        "Connection statistics"
                    );
                }

                accept_result = listener.accept() => {
                    instance.connect_signal().reset();
                    match accept_result {
                        Ok((stream, _addr)) => {
                            self.admit(&mut instance, stream, &done_tx);
                        }
                        Err(e) => {
                            error!(instance = %instance.id(), "Failed to accept connection: {}", e);
                        }
                    }
                    instance.connect_signal().set();
                }
            }
        }

        drop(listener);
        self.drain(&mut instance, &mut done_rx).await;

        let stats = instance.stats();
        info!(
            instance = %instance.id(),
            served = stats.total_connections_served,
            still_active = stats.active_connections,
            "Shutting proxy down"
        );
        instance.destroy();

        if let Err(e) = std::fs::remove_file(&self.config.server.listen_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove socket file {}: {}",
                    self.config.server.listen_path.display(),
                    e
                );
            }
        }
        Ok(())
    }

    /// Registers an accepted client and spawns its pump.
    ///
    /// Rejecting one connection (registry at capacity) must not stop the
    /// loop; the stream is simply dropped.
    fn admit(
        &self,
        instance: &mut ProxyInstance<ConnEntry>,
        stream: tokio::net::UnixStream,
        done_tx: &mpsc::Sender<PumpDone>,
    ) {
        let handle = match instance.allocate_connection(ConnEntry::new()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(instance = %instance.id(), "Rejecting connection: {}", e);
                return;
            }
        };

        let pump = tokio::spawn(pump::run(
            handle,
            stream,
            self.config.server.upstream.clone(),
            self.config.server.relay_timeout,
            done_tx.clone(),
        ));
        if let Some(entry) = instance.connection_mut(handle) {
            entry.attach(pump);
        }
        debug!(
            instance = %instance.id(),
            conn = %handle,
            active = instance.active_connections(),
            "Connection admitted"
        );
    }

    /// Releases the record for a connection whose pump finished.
    fn finish_connection(instance: &mut ProxyInstance<ConnEntry>, done: PumpDone) {
        let duration = instance
            .connection(done.handle)
            .map(|entry| entry.accepted_at.elapsed());
        match done.outcome {
            PumpOutcome::Complete {
                bytes_up,
                bytes_down,
            } => {
                debug!(
                    instance = %instance.id(),
                    conn = %done.handle,
                    bytes_up,
                    bytes_down,
                    duration_ms = duration.map(|d| d.as_millis()).unwrap_or(0),
                    "Connection finished"
                );
            }
            PumpOutcome::Failed(e) => {
                warn!(
                    instance = %instance.id(),
                    conn = %done.handle,
                    "Connection failed: {:#}",
                    e
                );
            }
            PumpOutcome::TimedOut => {
                warn!(
                    instance = %instance.id(),
                    conn = %done.handle,
                    "Connection timed out"
                );
            }
        }
        instance.deallocate_connection(done.handle);
    }

    /// Waits for running pumps to finish, up to the configured shutdown
    /// timeout. Whatever is still live afterwards is reclaimed by the bulk
    /// sweep in destroy, which aborts the pump through the record drop.
    async fn drain(
        &self,
        instance: &mut ProxyInstance<ConnEntry>,
        done_rx: &mut mpsc::Receiver<PumpDone>,
    ) {
        let deadline = Instant::now() + self.config.server.shutdown_timeout;
        info!(
            instance = %instance.id(),
            active = instance.active_connections(),
            timeout = ?self.config.server.shutdown_timeout,
            "Waiting for active connections to close"
        );

        while instance.active_connections() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    instance = %instance.id(),
                    remaining = instance.active_connections(),
                    "Shutdown timeout reached with connections still active"
                );
                return;
            }
            match tokio::time::timeout(remaining, done_rx.recv()).await {
                Ok(Some(done)) => Self::finish_connection(instance, done),
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        instance = %instance.id(),
                        remaining = instance.active_connections(),
                        "Shutdown timeout reached with connections still active"
                    );
                    return;
                }
            }
        }
        info!(instance = %instance.id(), "All connections closed gracefully");
    }
}
