//! UDP ingestion listener
//!
//! Runs the receive loop and spawns one handler per datagram.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::message;
use crate::queue::QueueSender;
use crate::server::config::IngestorConfig;
use crate::server::forwarder::DurableForwarder;
use crate::stats::RelayStats;

/// Datagram ingestor
///
/// Receiving never waits on handlers. When `max_in_flight` handlers are
/// already running, further datagrams are dropped until one finishes.
///
/// The socket belongs to the receive loop and is closed as soon as the
/// loop exits, even while handlers are still draining.
pub struct DatagramIngestor<Q: QueueSender + 'static> {
    config: IngestorConfig,
    socket: Mutex<Option<UdpSocket>>,
    local_addr: SocketAddr,
    forwarder: Arc<DurableForwarder<Q>>,
    stats: Arc<RelayStats>,
    in_flight: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl<Q: QueueSender + 'static> DatagramIngestor<Q> {
    /// Bind the ingestion socket
    pub async fn bind(
        config: IngestorConfig,
        forwarder: Arc<DurableForwarder<Q>>,
        stats: Arc<RelayStats>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = socket.local_addr()?;

        let in_flight = if config.max_in_flight > 0 {
            Some(Arc::new(Semaphore::new(config.max_in_flight)))
        } else {
            None
        };

        Ok(Self {
            config,
            socket: Mutex::new(Some(socket)),
            local_addr,
            forwarder,
            stats,
            in_flight,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared ingestion counters
    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Token that stops the receive loop when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the receive loop
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Number of handlers still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every spawned handler to finish
    ///
    /// Only returns once the receive loop has exited.
    pub async fn wait_in_flight(&self) {
        self.tracker.wait().await;
    }

    /// Run the receive loop until [`stop`](Self::stop) is called
    ///
    /// The socket is closed when this returns, so the loop can only run once.
    pub async fn run(&self) -> Result<()> {
        let Some(socket) = self.socket.lock().await.take() else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "ingestion socket already closed",
            )));
        };
        tracing::info!(addr = %self.local_addr, "Telemetry ingestor listening");

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, peer_addr)) => {
                        self.handle_datagram(Bytes::copy_from_slice(&buf[..len]), peer_addr);
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to receive datagram");
                    }
                },
            }
        }

        drop(socket);
        self.tracker.close();
        tracing::info!(
            addr = %self.local_addr,
            in_flight = self.tracker.len(),
            "Telemetry ingestor stopped"
        );
        Ok(())
    }

    /// Run the receive loop until `shutdown` completes
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                self.stop();
            }
        }

        run.await
    }

    fn handle_datagram(&self, payload: Bytes, peer_addr: SocketAddr) {
        // Check in-flight limit
        let permit = if let Some(ref sem) = self.in_flight {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Datagram dropped: in-flight limit reached");
                    self.stats.record_dropped();
                    return;
                }
            }
        } else {
            None
        };

        let forwarder = Arc::clone(&self.forwarder);
        let stats = Arc::clone(&self.stats);

        self.tracker.spawn(async move {
            let _permit = permit;
            process_datagram(payload, peer_addr, &forwarder, &stats).await;
        });
    }
}

async fn process_datagram<Q: QueueSender>(
    payload: Bytes,
    peer_addr: SocketAddr,
    forwarder: &DurableForwarder<Q>,
    stats: &RelayStats,
) {
    let mut message = match message::decode(&payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(
                peer = %peer_addr,
                kind = e.kind(),
                error = %e,
                "Dropping malformed datagram"
            );
            stats.record_decode_failure();
            return;
        }
    };

    message.stamp(Some(peer_addr));
    stats.record_received(message.timestamp);

    match forwarder.submit(&message).await {
        Ok(()) => stats.record_forwarded(),
        Err(_) => stats.record_forward_failure(),
    }
}
