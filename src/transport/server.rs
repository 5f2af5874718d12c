//! TCP listener
//!
//! Accepts connections and spawns one `handle_connection` task per client.
//! The number of simultaneous connections is capped by
//! `broker.max_connections` (clamped to what a tokio `Semaphore` can hold);
//! connections over the cap are dropped right after `accept`. Accepted
//! sockets get `TCP_NODELAY` and `SO_KEEPALIVE`. Accept errors back off
//! exponentially so a persistent failure such as `EMFILE` does not spin. Cancelling the shutdown token stops accepting, closes
//! every open connection and waits for their tasks.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::Broker;
use crate::config::{BrokerSettings, Settings};
use crate::transport::connection::handle_connection;
use crate::utils::Result;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Bind the configured address and serve until `shutdown` is cancelled.
pub async fn start_server(
    settings: Settings,
    broker: Arc<Broker>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(settings.server.bind_addr()).await?;
    info!("broke listening on {}", listener.local_addr()?);
    serve(listener, broker, Arc::new(settings.broker), shutdown).await
}

/// Serve connections from an already bound listener.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    settings: Arc<BrokerSettings>,
    shutdown: CancellationToken,
) -> Result<()> {
    let limit = connection_limit(settings.max_connections);
    let limiter = Arc::new(Semaphore::new(limit));
    let mut connections = JoinSet::new();
    let mut backoff = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = joined {
                    error!("connection task failed: {err}");
                }
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => {
                        backoff = None;
                        accepted
                    }
                    Err(err) => {
                        let delay = next_backoff(backoff);
                        backoff = Some(delay);
                        warn!("accept failed: {err}, retrying in {delay:?}");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                };

                let Ok(permit) = limiter.clone().try_acquire_owned() else {
                    warn!(%peer, "connection limit of {limit} reached, dropping");
                    continue;
                };

                if let Err(err) = configure_stream(&stream) {
                    debug!(%peer, "failed to set socket options: {err}");
                }

                let broker = broker.clone();
                let settings = settings.clone();
                let shutdown = shutdown.clone();
                connections.spawn(
                    async move {
                        let reason = handle_connection(stream, broker, settings, shutdown).await;
                        debug!(?reason, "connection finished");
                        drop(permit);
                    }
                    .instrument(info_span!("connection", %peer)),
                );
            }
        }
    }

    info!(open = connections.len(), "listener shutting down");
    while let Some(joined) = connections.join_next().await {
        if let Err(err) = joined {
            error!("connection task failed: {err}");
        }
    }
    Ok(())
}

pub(crate) fn connection_limit(max_connections: usize) -> usize {
    max_connections.min(Semaphore::MAX_PERMITS)
}

pub(crate) fn next_backoff(current: Option<Duration>) -> Duration {
    current.map_or(ACCEPT_BACKOFF_MIN, |delay| {
        delay.saturating_mul(2).min(ACCEPT_BACKOFF_MAX)
    })
}

pub(crate) fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)
}
