//! Wiring of the whole relay
//!
//! [`Relay::start`] brings every component up in dependency order and
//! [`Relay::shutdown`] takes them down in reverse:
//!
//! 1. stop the ingestor and wait for its in-flight handlers
//! 2. stop the consumer (drains the in-flight delivery)
//! 3. close the queue
//! 4. stop the live feed, the dashboard subscriber and the reporter

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::consumer::{ConsumerStats, QueueConsumer};
use crate::error::{Error, Result};
use crate::feed::LiveFeedServer;
use crate::hub::LiveBroadcastHub;
use crate::queue::{self, MemoryQueue};
use crate::report;
use crate::server::{DatagramIngestor, DurableForwarder};
use crate::stats::{RelayStats, RollingStats};

/// A running relay
pub struct Relay {
    config: RelayConfig,
    stats: Arc<RelayStats>,
    queue: MemoryQueue,
    hub: Arc<LiveBroadcastHub>,
    rolling: Arc<RwLock<RollingStats>>,
    ingestor: Arc<DatagramIngestor<MemoryQueue>>,
    ingestor_task: JoinHandle<Result<()>>,
    consumer: QueueConsumer<MemoryQueue, LiveBroadcastHub>,
    feed: Option<(Arc<LiveFeedServer>, JoinHandle<Result<()>>)>,
    background: CancellationToken,
    reporter: JoinHandle<()>,
    subscriber: JoinHandle<()>,
}

impl Relay {
    /// Validate `config` and start every component
    pub async fn start(config: RelayConfig) -> Result<Self> {
        config.validate()?;

        let queue = queue::connect(&config.queue)?;
        let stats = Arc::new(RelayStats::new());
        let hub = Arc::new(LiveBroadcastHub::with_capacity(config.hub_capacity));
        let rolling = Arc::new(RwLock::new(RollingStats::with_capacity(config.window_capacity)));
        let background = CancellationToken::new();

        // Bind both sockets before anything is spawned
        let forwarder = Arc::new(DurableForwarder::new(
            Arc::new(queue.clone()),
            config.ingestor.forward_timeout,
        ));
        let ingestor = Arc::new(
            DatagramIngestor::bind(config.ingestor.clone(), forwarder, Arc::clone(&stats)).await?,
        );
        let feed_server = match &config.feed {
            Some(feed_config) => {
                Some(Arc::new(LiveFeedServer::bind(feed_config.clone(), Arc::clone(&hub)).await?))
            }
            None => None,
        };

        let subscriber =
            report::spawn_rolling_subscriber(&hub, Arc::clone(&rolling), background.child_token())?;

        let consumer =
            QueueConsumer::with_config(queue.clone(), Arc::clone(&hub), config.consumer.clone());
        if let Err(e) = consumer.start().await {
            background.cancel();
            return Err(e);
        }

        let feed = feed_server.map(|server| {
            let runner = Arc::clone(&server);
            let task = tokio::spawn(async move { runner.run().await });
            (server, task)
        });

        let runner = Arc::clone(&ingestor);
        let ingestor_task = tokio::spawn(async move { runner.run().await });

        let reporter = report::spawn_stats_reporter(
            Arc::clone(&stats),
            queue.clone(),
            Arc::clone(&rolling),
            config.stats_interval,
            background.child_token(),
        );

        tracing::info!(
            udp = %ingestor.local_addr(),
            feed = ?feed.as_ref().map(|(server, _)| server.local_addr()),
            queue = %queue.name(),
            "Relay started"
        );

        Ok(Self {
            config,
            stats,
            queue,
            hub,
            rolling,
            ingestor,
            ingestor_task,
            consumer,
            feed,
            background,
            reporter,
            subscriber,
        })
    }

    /// Address datagrams are received on
    pub fn ingest_addr(&self) -> SocketAddr {
        self.ingestor.local_addr()
    }

    /// Address of the live feed, if enabled
    pub fn feed_addr(&self) -> Option<SocketAddr> {
        self.feed.as_ref().map(|(server, _)| server.local_addr())
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn consumer_stats(&self) -> &Arc<ConsumerStats> {
        self.consumer.stats()
    }

    pub fn hub(&self) -> &Arc<LiveBroadcastHub> {
        &self.hub
    }

    pub fn queue(&self) -> &MemoryQueue {
        &self.queue
    }

    pub fn rolling(&self) -> &Arc<RwLock<RollingStats>> {
        &self.rolling
    }

    /// Resolves if the ingestor's receive loop ends on its own
    pub async fn ingestor_stopped(&mut self) -> Result<()> {
        match (&mut self.ingestor_task).await {
            Ok(result) => result,
            Err(e) => Err(Error::Panicked(e.to_string())),
        }
    }

    /// Shut everything down, giving up after the configured timeout
    pub async fn shutdown(self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;

        match tokio::time::timeout(timeout, self.shutdown_inner()).await {
            Ok(()) => {
                tracing::info!("Relay stopped");
                Ok(())
            }
            Err(_) => {
                tracing::warn!(timeout = ?timeout, "Shutdown timed out, abandoning outstanding tasks");
                Err(Error::ShutdownTimeout(timeout))
            }
        }
    }

    async fn shutdown_inner(self) {
        let Relay {
            stats,
            queue,
            hub,
            ingestor,
            ingestor_task,
            consumer,
            feed,
            background,
            reporter,
            subscriber,
            ..
        } = self;

        ingestor.stop();
        if !ingestor_task.is_finished() {
            if let Ok(Err(e)) = ingestor_task.await {
                tracing::error!(error = %e, "Ingestor failed");
            }
        }
        ingestor.wait_in_flight().await;
        tracing::debug!(total = stats.total_messages(), "Ingestor drained");

        consumer.stop().await;
        queue.close().await;

        if let Some((server, task)) = feed {
            server.stop();
            if let Ok(Err(e)) = task.await {
                tracing::error!(error = %e, "Live feed failed");
            }
            server.wait().await;
        }

        background.cancel();
        hub.close();
        join_logged("stats reporter", reporter).await;
        join_logged("rolling subscriber", subscriber).await;
    }
}

/// Await a background task; a panic or cancellation is logged, never propagated
async fn join_logged(task: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(task, error = %e, "Background task failed");
            false
        }
    }
}
