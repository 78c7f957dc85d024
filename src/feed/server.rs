//! Live feed listener
//!
//! Handles the TCP accept loop and spawns one writer per dashboard client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::feed::config::FeedConfig;
use crate::feed::connection::FeedConnection;
use crate::hub::LiveBroadcastHub;

/// TCP endpoint streaming hub events to dashboard clients
pub struct LiveFeedServer {
    config: FeedConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    hub: Arc<LiveBroadcastHub>,
    next_conn_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl LiveFeedServer {
    /// Bind the feed listener
    pub async fn bind(config: FeedConfig, hub: Arc<LiveBroadcastHub>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Ok(Self {
            config,
            listener,
            local_addr,
            hub,
            next_conn_id: AtomicU64::new(1),
            connection_semaphore,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and end every client connection
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Number of connected clients
    pub fn connection_count(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every client task to finish once the accept loop has exited
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Run the accept loop until [`stop`](Self::stop) is called
    pub async fn run(&self) -> Result<()> {
        tracing::info!(addr = %self.local_addr, "Live feed listening");

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.listener.accept() => match result {
                    Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        self.tracker.close();
        tracing::info!(addr = %self.local_addr, "Live feed stopped");
        Ok(())
    }

    /// Run the accept loop until `shutdown` completes
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            _ = shutdown => self.stop(),
        }

        run.await
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let subscription = match self.hub.connect() {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(peer = %peer_addr, error = %e, "Connection rejected");
                return;
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(conn_id = conn_id, peer = %peer_addr, "Feed client connected");

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let shutdown = self.shutdown.child_token();

        self.tracker.spawn(async move {
            let _permit = permit;
            let (reader, writer) = socket.into_split();
            let mut connection =
                FeedConnection::new(conn_id, peer_addr, reader, writer, subscription, shutdown);

            if let Err(e) = connection.run().await {
                tracing::debug!(conn_id = conn_id, error = %e, "Feed connection error");
            }

            tracing::debug!(
                conn_id = conn_id,
                events = connection.events_written(),
                "Feed client disconnected"
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};

    use crate::hub::{BroadcastHub, DEVICE_MESSAGE_EVENT};
    use crate::message::DeviceMessage;

    async fn start(config: FeedConfig, hub: Arc<LiveBroadcastHub>) -> Arc<LiveFeedServer> {
        let config = config.bind("127.0.0.1:0".parse().unwrap());
        let server = Arc::new(LiveFeedServer::bind(config, hub).await.unwrap());

        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        server
    }

    async fn wait_for_subscribers(hub: &LiveBroadcastHub, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.subscriber_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_client_receives_json_lines() {
        let hub = Arc::new(LiveBroadcastHub::new());
        let server = start(FeedConfig::default(), Arc::clone(&hub)).await;

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        hub.send_to_all(DEVICE_MESSAGE_EVENT, &DeviceMessage::new("d1", "Temperature: 42"))
            .await
            .unwrap();

        let mut lines = BufReader::new(stream).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["event"], "ReceiveDeviceMessage");
        assert_eq!(json["payload"]["deviceId"], "d1");
        assert_eq!(json["payload"]["data"], "Temperature: 42");
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let hub = Arc::new(LiveBroadcastHub::new());
        let server = start(FeedConfig::default().max_connections(1), Arc::clone(&hub)).await;

        let _first = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), second.read(&mut buf))
            .await
            .unwrap();

        // Rejected sockets are closed without a subscription
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_hang_up_frees_connection_slot() {
        let hub = Arc::new(LiveBroadcastHub::new());
        let server = start(FeedConfig::default().max_connections(1), Arc::clone(&hub)).await;

        let first = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_subscribers(&hub, 1).await;
        drop(first);

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count() > 0 || hub.subscriber_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let _second = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_subscribers(&hub, 1).await;
    }

    #[tokio::test]
    async fn test_stop_disconnects_clients() {
        let hub = Arc::new(LiveBroadcastHub::new());
        let server = start(FeedConfig::default(), Arc::clone(&hub)).await;

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_for_subscribers(&hub, 1).await;

        server.stop();
        tokio::time::timeout(Duration::from_secs(5), server.wait())
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
