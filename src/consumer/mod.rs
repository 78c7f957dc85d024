//! Durable queue consumer
//!
//! Drains the durable queue one delivery at a time and rebroadcasts each
//! message through a [`BroadcastHub`]:
//!
//! ```text
//!   receive() ──► decode ──► send_to_all() ──► complete()
//!                   │              │
//!                   └── error ─────┴─────────► abandon()
//! ```
//!
//! Every error (and panic) in processing is contained at the delivery: the
//! delivery is abandoned so the queue can redeliver it, and the loop moves
//! on.

pub mod config;
pub mod state;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hub::BroadcastHub;
use crate::message::{self, DeviceMessage};
use crate::queue::{Delivery, QueueConnection, QueueReceiver};

pub use config::{ConsumerConfig, MAX_CONCURRENT_DELIVERIES};
pub use state::ConsumerState;

use state::StateCell;

/// Delivery outcome counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    completed: AtomicU64,
    abandoned: AtomicU64,
    settle_failures: AtomicU64,
}

impl ConsumerStats {
    /// Deliveries broadcast and completed
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Deliveries returned to the queue after a processing failure
    pub fn abandoned(&self) -> u64 {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// Complete/abandon calls the queue rejected
    pub fn settle_failures(&self) -> u64 {
        self.settle_failures.load(Ordering::Relaxed)
    }
}

/// Single-concurrency consumer of the durable queue
///
/// Owns the queue connection until it stops. On the way down the receiver
/// is closed before the connection is dropped.
pub struct QueueConsumer<C, H>
where
    C: QueueConnection + 'static,
    H: BroadcastHub + 'static,
{
    config: ConsumerConfig,
    connection: Mutex<Option<C>>,
    hub: Arc<H>,
    state: Arc<StateCell>,
    stats: Arc<ConsumerStats>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C, H> QueueConsumer<C, H>
where
    C: QueueConnection + 'static,
    H: BroadcastHub + 'static,
{
    /// Create a consumer with default configuration
    pub fn new(connection: C, hub: Arc<H>) -> Self {
        Self::with_config(connection, hub, ConsumerConfig::default())
    }

    /// Create a consumer with custom configuration
    pub fn with_config(connection: C, hub: Arc<H>, config: ConsumerConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(Some(connection)),
            hub,
            state: Arc::new(StateCell::new()),
            stats: Arc::new(ConsumerStats::default()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConsumerState {
        self.state.get()
    }

    /// Delivery outcome counters
    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    /// Open the receiver and start the consumption loop
    ///
    /// Fails with [`Error::InvalidState`] if the consumer was already
    /// started or stopped; a fresh instance is needed to start again.
    pub async fn start(&self) -> Result<()> {
        if !self.state.begin_start() {
            return Err(Error::InvalidState(self.state.get()));
        }

        let connection = match self.connection.lock().await.take() {
            Some(connection) => connection,
            None => {
                self.state.finish_stop();
                return Err(Error::InvalidState(ConsumerState::Stopped));
            }
        };

        let receiver = match connection.open_receiver(MAX_CONCURRENT_DELIVERIES).await {
            Ok(receiver) => Arc::new(receiver),
            Err(e) => {
                tracing::error!(error = %e, "Failed to open queue receiver");
                self.state.finish_stop();
                return Err(e.into());
            }
        };

        let worker = Worker {
            receiver,
            hub: Arc::clone(&self.hub),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
            shutdown: self.shutdown.clone(),
        };
        let state = Arc::clone(&self.state);

        let handle = tokio::spawn(async move {
            if state.transition(ConsumerState::Starting, ConsumerState::Running) {
                tracing::info!("Queue consumer started");
                worker.run().await;
            }

            state.begin_stop();
            worker.receiver.close().await;
            drop(worker);
            drop(connection);
            state.finish_stop();

            tracing::info!("Queue consumer stopped");
        });

        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop gracefully
    ///
    /// Stops taking new deliveries, waits for the in-flight one to be
    /// settled, then releases the receiver and the connection.
    pub async fn stop(&self) {
        if !self.state.has_started() {
            self.state.retire();
            self.connection.lock().await.take();
            return;
        }

        tracing::info!("Queue consumer stopping");
        self.state.begin_stop();
        self.shutdown.cancel();

        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue consumer task failed");
            }
        }
        self.state.finish_stop();
    }

    /// Wait for the consumption loop to end on its own (e.g. the queue closed)
    pub async fn wait(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Queue consumer task failed");
            }
        }
    }
}

/// State owned by the consumption loop
struct Worker<R, H> {
    receiver: Arc<R>,
    hub: Arc<H>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
    shutdown: CancellationToken,
}

impl<R, H> Worker<R, H>
where
    R: QueueReceiver + 'static,
    H: BroadcastHub + 'static,
{
    async fn run(&self) {
        loop {
            // Only the receive is cancelled; a delivery in progress always runs to settlement.
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = self.receiver.receive() => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => {
                    tracing::info!("Queue closed, consumer loop ending");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Error receiving from queue");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let Delivery {
            body,
            delivery_count,
            handle,
        } = delivery;
        let lock_token = handle.lock_token();

        let outcome = AssertUnwindSafe(self.rebroadcast(&body))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Error::Panicked(panic_message(&*panic))));

        match outcome {
            Ok(message) => match self.receiver.complete(handle).await {
                Ok(()) => {
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        device_id = %message.device_id,
                        lock_token,
                        "Message broadcast and completed"
                    );
                }
                Err(e) => {
                    self.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, lock_token, "Failed to complete message");
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    lock_token,
                    delivery_count,
                    "Error processing message, abandoning"
                );
                match self.receiver.abandon(handle).await {
                    Ok(()) => {
                        self.stats.abandoned.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.stats.settle_failures.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(error = %e, lock_token, "Failed to abandon message");
                    }
                }
            }
        }
    }

    async fn rebroadcast(&self, body: &[u8]) -> Result<DeviceMessage> {
        let message = message::decode(body)?;
        self.hub
            .send_to_all(&self.config.event_name, &message)
            .await?;
        Ok(message)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::hub::{HubError, LiveBroadcastHub};
    use crate::message::encode;
    use crate::queue::{AckHandle, MemoryQueue, MemoryReceiver, QueueConfig, QueueError, QueueSender};

    /// Records successful broadcasts; fails the first `failures` attempts per device
    #[derive(Default)]
    struct FlakyHub {
        failures: HashMap<String, u32>,
        attempts: std::sync::Mutex<HashMap<String, u32>>,
        delivered: std::sync::Mutex<Vec<DeviceMessage>>,
        delay: Duration,
    }

    impl FlakyHub {
        fn failing(device: &str, times: u32) -> Self {
            Self {
                failures: HashMap::from([(device.to_string(), times)]),
                ..Default::default()
            }
        }

        fn delivered(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.device_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl BroadcastHub for FlakyHub {
        async fn send_to_all(&self, _event: &str, message: &DeviceMessage) -> std::result::Result<(), HubError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let n = attempts.entry(message.device_id.clone()).or_insert(0);
                *n += 1;
                *n
            };

            if attempt <= self.failures.get(&message.device_id).copied().unwrap_or(0) {
                return Err(HubError::Transport("subscriber transport down".into()));
            }

            self.delivered.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    struct PanickingHub;

    #[async_trait]
    impl BroadcastHub for PanickingHub {
        async fn send_to_all(&self, _event: &str, message: &DeviceMessage) -> std::result::Result<(), HubError> {
            if message.device_id == "boom" {
                panic!("hub exploded");
            }
            Ok(())
        }
    }

    async fn send(queue: &MemoryQueue, device: &str) {
        let body = encode(&DeviceMessage::new(device, "Temperature: 21")).unwrap();
        queue.send(body).await.unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_broadcast_failure_abandons_then_redelivers() {
        let queue = MemoryQueue::new("q");
        let hub = Arc::new(FlakyHub::failing("x", 1));
        let consumer = QueueConsumer::new(queue.clone(), Arc::clone(&hub));
        consumer.start().await.unwrap();

        send(&queue, "x").await;
        send(&queue, "y").await;

        let stats = Arc::clone(consumer.stats());
        wait_until(|| stats.completed() == 2).await;

        assert_eq!(stats.abandoned(), 1);
        assert_eq!(stats.settle_failures(), 0);

        let delivered = hub.delivered();
        assert_eq!(delivered.iter().filter(|d| *d == "x").count(), 1);
        assert_eq!(delivered.iter().filter(|d| *d == "y").count(), 1);

        consumer.stop().await;
        assert!(queue.is_empty().await);
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_dead_lettered() {
        let config = QueueConfig::new("memory://", "q").max_delivery_count(3);
        let queue = MemoryQueue::with_config(&config);
        let hub = Arc::new(FlakyHub::failing("x", u32::MAX));
        let consumer = QueueConsumer::new(queue.clone(), Arc::clone(&hub));
        consumer.start().await.unwrap();

        send(&queue, "x").await;
        send(&queue, "y").await;

        let stats = Arc::clone(consumer.stats());
        wait_until(|| stats.completed() == 1 && stats.abandoned() == 3).await;

        consumer.stop().await;
        assert_eq!(hub.delivered(), vec!["y".to_string()]);
        assert_eq!(queue.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_abandoned() {
        let config = QueueConfig::new("memory://", "q").max_delivery_count(1);
        let queue = MemoryQueue::with_config(&config);
        let hub = Arc::new(FlakyHub::default());
        let consumer = QueueConsumer::new(queue.clone(), Arc::clone(&hub));
        consumer.start().await.unwrap();

        queue.send(Bytes::from_static(b"{not json")).await.unwrap();
        send(&queue, "ok").await;

        let stats = Arc::clone(consumer.stats());
        wait_until(|| stats.completed() == 1).await;

        consumer.stop().await;
        assert_eq!(stats.abandoned(), 1);
        assert_eq!(hub.delivered(), vec!["ok".to_string()]);
        assert_eq!(
            queue.dead_letters().await,
            vec![Bytes::from_static(b"{not json")]
        );
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let config = QueueConfig::new("memory://", "q").max_delivery_count(1);
        let queue = MemoryQueue::with_config(&config);
        let consumer = QueueConsumer::new(queue.clone(), Arc::new(PanickingHub));
        consumer.start().await.unwrap();

        send(&queue, "boom").await;
        send(&queue, "fine").await;

        let stats = Arc::clone(consumer.stats());
        wait_until(|| stats.completed() == 1).await;

        assert_eq!(stats.abandoned(), 1);
        assert_eq!(consumer.state(), ConsumerState::Running);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_rebroadcast_to_live_hub() {
        let queue = MemoryQueue::new("q");
        let hub = Arc::new(LiveBroadcastHub::new());
        let mut subscription = hub.connect().unwrap();
        let consumer = QueueConsumer::new(queue.clone(), Arc::clone(&hub));
        consumer.start().await.unwrap();

        send(&queue, "d1").await;

        let event = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*event.name, "ReceiveDeviceMessage");
        assert_eq!(event.message.device_id, "d1");
        assert_eq!(event.message.data, "Temperature: 21");

        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_in_flight_delivery() {
        let queue = MemoryQueue::new("q");
        let hub = Arc::new(FlakyHub {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let consumer = QueueConsumer::new(queue.clone(), Arc::clone(&hub));
        consumer.start().await.unwrap();

        send(&queue, "slow").await;
        for _ in 0..200 {
            if queue.in_flight().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(queue.in_flight().await, 1);

        consumer.stop().await;

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert_eq!(hub.delivered(), vec!["slow".to_string()]);
        assert_eq!(consumer.stats().completed(), 1);
        assert_eq!(queue.in_flight().await, 0);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_stop_releases_receiver() {
        let queue = MemoryQueue::new("q");
        let consumer = QueueConsumer::new(queue.clone(), Arc::new(FlakyHub::default()));
        consumer.start().await.unwrap();
        consumer.stop().await;

        // Messages sent after stop stay queued for the next consumer
        send(&queue, "later").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(consumer.stats().completed(), 0);
    }

    #[tokio::test]
    async fn test_restart_requires_fresh_instance() {
        let queue = MemoryQueue::new("q");
        let consumer = QueueConsumer::new(queue.clone(), Arc::new(FlakyHub::default()));

        consumer.start().await.unwrap();
        assert!(matches!(
            consumer.start().await,
            Err(Error::InvalidState(_))
        ));

        consumer.stop().await;
        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(matches!(
            consumer.start().await,
            Err(Error::InvalidState(ConsumerState::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let queue = MemoryQueue::new("q");
        let consumer = QueueConsumer::new(queue, Arc::new(FlakyHub::default()));

        consumer.stop().await;

        assert_eq!(consumer.state(), ConsumerState::Stopped);
        assert!(consumer.start().await.is_err());
    }

    #[tokio::test]
    async fn test_queue_close_ends_loop() {
        let queue = MemoryQueue::new("q");
        let consumer = QueueConsumer::new(queue.clone(), Arc::new(FlakyHub::default()));
        consumer.start().await.unwrap();

        queue.close().await;
        tokio::time::timeout(Duration::from_secs(2), consumer.wait())
            .await
            .unwrap();

        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_start_on_closed_queue_fails() {
        let queue = MemoryQueue::new("q");
        queue.close().await;
        let consumer = QueueConsumer::new(queue, Arc::new(FlakyHub::default()));

        assert!(matches!(consumer.start().await, Err(Error::Queue(_))));
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    /// Connection whose receivers fail their first `outages` receives
    struct UnreliableConnection {
        queue: MemoryQueue,
        outages: u32,
    }

    struct UnreliableReceiver {
        inner: MemoryReceiver,
        outages: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl QueueConnection for UnreliableConnection {
        type Receiver = UnreliableReceiver;

        async fn open_receiver(&self, max: usize) -> std::result::Result<UnreliableReceiver, QueueError> {
            Ok(UnreliableReceiver {
                inner: self.queue.open_receiver(max).await?,
                outages: std::sync::Mutex::new(self.outages),
            })
        }
    }

    #[async_trait]
    impl QueueReceiver for UnreliableReceiver {
        async fn receive(&self) -> std::result::Result<Option<Delivery>, QueueError> {
            {
                let mut outages = self.outages.lock().unwrap();
                if *outages > 0 {
                    *outages -= 1;
                    return Err(QueueError::Unavailable("broker unreachable".into()));
                }
            }
            self.inner.receive().await
        }

        async fn complete(&self, handle: AckHandle) -> std::result::Result<(), QueueError> {
            self.inner.complete(handle).await
        }

        async fn abandon(&self, handle: AckHandle) -> std::result::Result<(), QueueError> {
            self.inner.abandon(handle).await
        }

        async fn close(&self) {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_receive_error_backs_off_and_continues() {
        let queue = MemoryQueue::new("q");
        let connection = UnreliableConnection {
            queue: queue.clone(),
            outages: 2,
        };
        let config = ConsumerConfig::default().error_backoff(Duration::from_millis(10));
        let hub = Arc::new(FlakyHub::default());
        let consumer = QueueConsumer::with_config(connection, Arc::clone(&hub), config);
        consumer.start().await.unwrap();

        send(&queue, "d1").await;

        let stats = Arc::clone(consumer.stats());
        wait_until(|| stats.completed() == 1).await;
        assert_eq!(consumer.state(), ConsumerState::Running);
        assert_eq!(hub.delivered(), vec!["d1".to_string()]);

        consumer.stop().await;
    }

    type EventLog = Arc<std::sync::Mutex<Vec<&'static str>>>;

    /// Connection that logs settlement, receiver close and its own drop
    struct RecordingConnection {
        queue: MemoryQueue,
        log: EventLog,
    }

    impl Drop for RecordingConnection {
        fn drop(&mut self) {
            self.log.lock().unwrap().push("connection_dropped");
        }
    }

    struct RecordingReceiver {
        inner: MemoryReceiver,
        log: EventLog,
    }

    #[async_trait]
    impl QueueConnection for RecordingConnection {
        type Receiver = RecordingReceiver;

        async fn open_receiver(&self, max: usize) -> std::result::Result<RecordingReceiver, QueueError> {
            Ok(RecordingReceiver {
                inner: self.queue.open_receiver(max).await?,
                log: Arc::clone(&self.log),
            })
        }
    }

    #[async_trait]
    impl QueueReceiver for RecordingReceiver {
        async fn receive(&self) -> std::result::Result<Option<Delivery>, QueueError> {
            self.inner.receive().await
        }

        async fn complete(&self, handle: AckHandle) -> std::result::Result<(), QueueError> {
            self.inner.complete(handle).await?;
            self.log.lock().unwrap().push("completed");
            Ok(())
        }

        async fn abandon(&self, handle: AckHandle) -> std::result::Result<(), QueueError> {
            self.inner.abandon(handle).await?;
            self.log.lock().unwrap().push("abandoned");
            Ok(())
        }

        async fn close(&self) {
            self.inner.close().await;
            self.log.lock().unwrap().push("receiver_closed");
        }
    }

    #[tokio::test]
    async fn test_stop_settles_then_closes_receiver_then_drops_connection() {
        let queue = MemoryQueue::new("q");
        let log = EventLog::default();
        let connection = RecordingConnection {
            queue: queue.clone(),
            log: Arc::clone(&log),
        };
        let hub = Arc::new(FlakyHub {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let consumer = QueueConsumer::new(connection, Arc::clone(&hub));
        consumer.start().await.unwrap();

        send(&queue, "slow").await;
        for _ in 0..200 {
            if queue.in_flight().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(queue.in_flight().await, 1);
        assert!(log.lock().unwrap().is_empty());

        consumer.stop().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["completed", "receiver_closed", "connection_dropped"]
        );
        assert_eq!(hub.delivered(), vec!["slow".to_string()]);
    }
}
