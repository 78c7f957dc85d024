//! Live broadcast hub for pub/sub fan-out
//!
//! The hub delivers each relayed message to every currently-connected
//! subscriber. It keeps no history: delivery is live only.
//!
//! # Architecture
//!
//! ```text
//!                   Arc<LiveBroadcastHub>
//!               ┌────────────────────────────┐
//!               │ tx: broadcast::Sender<     │
//!               │       HubEvent { message,  │
//!               │                  line } >  │
//!               └─────────────┬──────────────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!   [QueueConsumer]     [Subscription]      [Subscription]
//!   send_to_all()        recv().await        recv().await
//!                             │                   │
//!                        feed socket        RollingStats
//! ```
//!
//! Producers go through the [`BroadcastHub`] trait, so the consumer can be
//! pointed at any push technology that offers "send to all".

pub mod broadcast;
pub mod error;
pub mod event;

use async_trait::async_trait;

use crate::message::DeviceMessage;

pub use broadcast::{LiveBroadcastHub, Subscription, DEFAULT_HUB_CAPACITY};
pub use error::{HubError, RecvError};
pub use event::{HubEvent, DEVICE_MESSAGE_EVENT};

/// Push side of a live broadcast channel
#[async_trait]
pub trait BroadcastHub: Send + Sync {
    /// Deliver `message` as `event_name` to every connected subscriber
    ///
    /// Must not wait on any individual subscriber.
    async fn send_to_all(&self, event_name: &str, message: &DeviceMessage) -> Result<(), HubError>;
}
