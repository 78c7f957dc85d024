//! Durable queue abstraction
//!
//! The relay only needs a handful of primitives from a durable,
//! at-least-once broker:
//!
//! ```text
//!   DurableForwarder ── send(body) ──►  ┌──────────────┐
//!                                       │ durable queue│
//!   QueueConsumer ◄── receive() ─────── │  (external)  │
//!        │                              └──────────────┘
//!        ├── complete(handle)  remove permanently
//!        └── abandon(handle)   return for redelivery
//! ```
//!
//! Redelivery, backoff and dead-lettering are owned by the queue
//! implementation. [`MemoryQueue`] is the in-process implementation used by
//! the binary and the tests.

pub mod config;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{Error, Result};

pub use config::QueueConfig;
pub use memory::{MemoryQueue, MemoryReceiver};

/// Error type for queue operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Queue or receiver has been closed
    #[error("queue is closed")]
    Closed,

    /// Queue is at capacity and not accepting messages
    #[error("queue is full ({0} messages)")]
    Full(usize),

    /// The delivery was already settled or its lock was released
    #[error("lock token {0} is not held")]
    LockLost(u64),

    /// Broker unreachable or refusing requests
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// Settlement handle for one delivery
///
/// Passing it to [`QueueReceiver::complete`] or [`QueueReceiver::abandon`]
/// settles the delivery and frees the receiver's concurrency slot.
#[derive(Debug)]
pub struct AckHandle {
    lock_token: u64,
    _permit: Option<OwnedSemaphorePermit>,
}

impl AckHandle {
    /// Create a handle for a lock token
    pub fn new(lock_token: u64) -> Self {
        Self {
            lock_token,
            _permit: None,
        }
    }

    pub(crate) fn with_permit(lock_token: u64, permit: OwnedSemaphorePermit) -> Self {
        Self {
            lock_token,
            _permit: Some(permit),
        }
    }

    /// Lock token identifying the delivery
    pub fn lock_token(&self) -> u64 {
        self.lock_token
    }
}

/// A message handed out by a receiver
#[derive(Debug)]
pub struct Delivery {
    /// Encoded message body
    pub body: Bytes,
    /// How many times this message has been delivered, starting at 1
    pub delivery_count: u32,
    /// Handle used to settle the delivery
    pub handle: AckHandle,
}

/// Submission side of the durable queue
#[async_trait]
pub trait QueueSender: Send + Sync {
    /// Submit one encoded message
    async fn send(&self, body: Bytes) -> std::result::Result<(), QueueError>;
}

/// Consumption side of the durable queue
///
/// A receiver is opened with a maximum number of unsettled deliveries;
/// `receive` waits while that many are outstanding.
#[async_trait]
pub trait QueueReceiver: Send + Sync {
    /// Wait for the next delivery, or `None` once the receiver or queue is closed
    async fn receive(&self) -> std::result::Result<Option<Delivery>, QueueError>;

    /// Settle a delivery as processed, removing it from the queue
    async fn complete(&self, handle: AckHandle) -> std::result::Result<(), QueueError>;

    /// Settle a delivery as failed, returning it for redelivery
    async fn abandon(&self, handle: AckHandle) -> std::result::Result<(), QueueError>;

    /// Stop handing out deliveries and release the receiver
    async fn close(&self);
}

/// A connection able to open receivers on one queue
///
/// Dropping the connection releases it; receivers opened from it must be
/// closed first.
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Receiver type handed out by this connection
    type Receiver: QueueReceiver + 'static;

    /// Open a receiver with at most `max_concurrent_deliveries` unsettled deliveries
    async fn open_receiver(
        &self,
        max_concurrent_deliveries: usize,
    ) -> std::result::Result<Self::Receiver, QueueError>;
}

/// Open the queue named in `config`
///
/// Only the in-process `memory://` backend is built in.
pub fn connect(config: &QueueConfig) -> Result<MemoryQueue> {
    config.validate()?;

    match config.connection.split_once("://") {
        Some(("memory", _)) => Ok(MemoryQueue::with_config(config)),
        Some((scheme, _)) => Err(Error::Config(format!(
            "unsupported queue backend '{}'",
            scheme
        ))),
        None => Err(Error::Config(format!(
            "queue connection '{}' has no scheme",
            config.connection
        ))),
    }
}
