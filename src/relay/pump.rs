//! Connection Pump
//!
//! Moves bytes between an accepted client stream and the upstream endpoint,
//! then reports how the transfer ended to the task owning the connection
//! registry. The pump never touches the registry itself; releasing the
//! record stays with its single owner.

use std::time::Duration;

use anyhow::Error;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::config::Endpoint;
use crate::proxy::ConnectionHandle;
use crate::relay::RelaySession;

/// Completion notice a pump task sends to the connection's owner.
#[derive(Debug)]
pub struct PumpDone {
    pub handle: ConnectionHandle,
    pub outcome: PumpOutcome,
}

/// How a pump finished.
#[derive(Debug)]
pub enum PumpOutcome {
    /// Both directions reached end of stream.
    Complete { bytes_up: u64, bytes_down: u64 },
    /// The upstream connect or the transfer itself failed.
    Failed(Error),
    /// The connect or the whole transfer exceeded the relay timeout.
    TimedOut,
}

/// Runs one connection end to end: connects to the upstream endpoint, relays
/// both directions until end of stream, failure, or timeout, then sends the
/// completion notice.
///
/// The owner releases the connection record when the notice arrives. If the
/// owner is already gone the notice is dropped with the channel.
pub async fn run(
    handle: ConnectionHandle,
    client: UnixStream,
    upstream: Endpoint,
    relay_timeout: Duration,
    done: mpsc::Sender<PumpDone>,
) {
    let outcome = pump(handle, client, &upstream, relay_timeout).await;
    if done.send(PumpDone { handle, outcome }).await.is_err() {
        debug!("Owner of {} is gone, completion notice dropped", handle);
    }
}

async fn pump(
    handle: ConnectionHandle,
    mut client: UnixStream,
    upstream: &Endpoint,
    relay_timeout: Duration,
) -> PumpOutcome {
    let mut session = RelaySession::new(handle, upstream.clone());

    match upstream {
        Endpoint::Unix(path) => match timeout(relay_timeout, UnixStream::connect(path)).await {
            Ok(Ok(mut stream)) => {
                relay_streams(&mut session, &mut client, &mut stream, relay_timeout).await
            }
            Ok(Err(e)) => {
                error!("Failed to connect {} to upstream {}: {}", handle, upstream, e);
                PumpOutcome::Failed(
                    Error::new(e).context(format!("connect to upstream {}", upstream)),
                )
            }
            Err(_) => {
                error!("Connect of {} to upstream {} timed out", handle, upstream);
                PumpOutcome::TimedOut
            }
        },
        Endpoint::Tcp(addr) => match timeout(relay_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                relay_streams(&mut session, &mut client, &mut stream, relay_timeout).await
            }
            Ok(Err(e)) => {
                error!("Failed to connect {} to upstream {}: {}", handle, upstream, e);
                PumpOutcome::Failed(
                    Error::new(e).context(format!("connect to upstream {}", upstream)),
                )
            }
            Err(_) => {
                error!("Connect of {} to upstream {} timed out", handle, upstream);
                PumpOutcome::TimedOut
            }
        },
    }
}

/// Relay both directions until end of stream, reporting totals through the
/// session.
async fn relay_streams<U>(
    session: &mut RelaySession,
    client: &mut UnixStream,
    upstream: &mut U,
    relay_timeout: Duration,
) -> PumpOutcome
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(relay_timeout, copy_bidirectional(client, upstream)).await {
        Ok(Ok((bytes_up, bytes_down))) => {
            session.record_transfer(bytes_up, bytes_down);
            session.log_stats();
            PumpOutcome::Complete {
                bytes_up,
                bytes_down,
            }
        }
        Ok(Err(e)) => {
            error!(
                "Relay for {} failed after {:?}: {}",
                session.handle(),
                session.duration(),
                e
            );
            session.log_stats();
            PumpOutcome::Failed(Error::new(e).context("data relay failed"))
        }
        Err(_) => {
            error!(
                "Relay for {} timed out after {:?}",
                session.handle(),
                relay_timeout
            );
            session.log_stats();
            PumpOutcome::TimedOut
        }
    }
}
