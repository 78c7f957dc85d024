//! In-process durable queue
//!
//! Messages live in memory for the lifetime of the process. Deliveries are
//! locked until settled: `complete` removes them, `abandon` puts them back
//! at the head of the queue, and a message abandoned `max_delivery_count`
//! times moves to the dead-letter list. Closing a receiver releases its
//! unsettled locks so nothing it held is lost.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, Semaphore};

use super::config::QueueConfig;
use super::{AckHandle, Delivery, QueueConnection, QueueError, QueueReceiver, QueueSender};

#[derive(Debug)]
struct StoredMessage {
    body: Bytes,
    delivery_count: u32,
}

#[derive(Debug)]
struct LockedMessage {
    message: StoredMessage,
    receiver_id: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    locked: HashMap<u64, LockedMessage>,
    dead_letters: Vec<Bytes>,
    next_lock_token: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    name: String,
    max_delivery_count: u32,
    max_size: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    next_receiver_id: AtomicU64,
}

/// In-memory queue with at-least-once delivery
///
/// Cheap to clone; clones share the same queue.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    /// Create a queue with default settings
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(&QueueConfig::new("memory://", name))
    }

    /// Create a queue from configuration
    pub fn with_config(config: &QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                max_delivery_count: config.max_delivery_count.max(1),
                max_size: config.max_size,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                next_receiver_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Open a receiver allowing at most `max_concurrent_deliveries` unsettled deliveries
    pub fn receiver(&self, max_concurrent_deliveries: usize) -> MemoryReceiver {
        MemoryReceiver {
            id: self.shared.next_receiver_id.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
            slots: Arc::new(Semaphore::new(max_concurrent_deliveries.max(1))),
        }
    }

    /// Messages waiting for delivery
    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.ready.len()
    }

    /// Whether no message is waiting for delivery
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages delivered but not yet settled
    pub async fn in_flight(&self) -> usize {
        self.shared.state.lock().await.locked.len()
    }

    /// Bodies of dead-lettered messages
    pub async fn dead_letters(&self) -> Vec<Bytes> {
        self.shared.state.lock().await.dead_letters.clone()
    }

    /// Close the queue
    ///
    /// Sends fail and receivers return `None` from then on.
    pub async fn close(&self) {
        let mut state = self.shared.state.lock().await;
        if !state.closed {
            state.closed = true;
            tracing::debug!(queue = %self.shared.name, "Queue closed");
        }
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl QueueSender for MemoryQueue {
    async fn send(&self, body: Bytes) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;

        if state.closed {
            return Err(QueueError::Closed);
        }
        if self.shared.max_size > 0 && state.ready.len() >= self.shared.max_size {
            return Err(QueueError::Full(self.shared.max_size));
        }

        state.ready.push_back(StoredMessage {
            body,
            delivery_count: 0,
        });
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl QueueConnection for MemoryQueue {
    type Receiver = MemoryReceiver;

    async fn open_receiver(
        &self,
        max_concurrent_deliveries: usize,
    ) -> Result<MemoryReceiver, QueueError> {
        if self.shared.state.lock().await.closed {
            return Err(QueueError::Closed);
        }
        Ok(self.receiver(max_concurrent_deliveries))
    }
}

/// Receiver for a [`MemoryQueue`]
#[derive(Debug)]
pub struct MemoryReceiver {
    id: u64,
    shared: Arc<Shared>,
    slots: Arc<Semaphore>,
}

impl MemoryReceiver {
    fn settle(state: &mut QueueState, token: u64) -> Result<StoredMessage, QueueError> {
        state
            .locked
            .remove(&token)
            .map(|locked| locked.message)
            .ok_or(QueueError::LockLost(token))
    }

    fn requeue_or_dead_letter(&self, state: &mut QueueState, message: StoredMessage) {
        if message.delivery_count >= self.shared.max_delivery_count {
            tracing::warn!(
                queue = %self.shared.name,
                delivery_count = message.delivery_count,
                "Message exceeded max delivery count, dead-lettering"
            );
            state.dead_letters.push(message.body);
        } else {
            state.ready.push_front(message);
        }
    }
}

#[async_trait]
impl QueueReceiver for MemoryReceiver {
    async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(permit) => permit,
            // Semaphore is closed when the receiver is closed
            Err(_) => return Ok(None),
        };

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().await;

                if state.closed || self.slots.is_closed() {
                    return Ok(None);
                }

                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;

                    let token = state.next_lock_token;
                    state.next_lock_token += 1;

                    let delivery = Delivery {
                        body: message.body.clone(),
                        delivery_count: message.delivery_count,
                        handle: AckHandle::with_permit(token, permit),
                    };
                    state.locked.insert(
                        token,
                        LockedMessage {
                            message,
                            receiver_id: self.id,
                        },
                    );

                    return Ok(Some(delivery));
                }
            }

            notified.await;
        }
    }

    async fn complete(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        Self::settle(&mut state, handle.lock_token())?;
        Ok(())
    }

    async fn abandon(&self, handle: AckHandle) -> Result<(), QueueError> {
        let mut state = self.shared.state.lock().await;
        let message = Self::settle(&mut state, handle.lock_token())?;
        self.requeue_or_dead_letter(&mut state, message);
        drop(state);

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.slots.close();

        let mut state = self.shared.state.lock().await;
        let held: Vec<u64> = state
            .locked
            .iter()
            .filter(|(_, locked)| locked.receiver_id == self.id)
            .map(|(token, _)| *token)
            .collect();

        let released = held.len();
        for token in held {
            if let Some(locked) = state.locked.remove(&token) {
                self.requeue_or_dead_letter(&mut state, locked.message);
            }
        }
        drop(state);

        if released > 0 {
            tracing::debug!(
                queue = %self.shared.name,
                released,
                "Released unsettled deliveries on receiver close"
            );
        }
        self.shared.notify.notify_waiters();
    }
}
