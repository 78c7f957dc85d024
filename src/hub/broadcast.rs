//! Live broadcast hub implementation
//!
//! Fans each event out to every connected subscriber over a
//! `tokio::sync::broadcast` channel.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::message::DeviceMessage;

use super::error::{HubError, RecvError};
use super::event::HubEvent;
use super::BroadcastHub;

/// Default number of events a subscriber may fall behind before lagging
pub const DEFAULT_HUB_CAPACITY: usize = 1024;

/// In-process fan-out hub
///
/// Subscribers join with [`connect`](Self::connect) and leave by dropping
/// their [`Subscription`]. Producers never wait on subscribers: a subscriber
/// that falls more than `capacity` events behind skips ahead instead of
/// holding up the others.
pub struct LiveBroadcastHub {
    tx: broadcast::Sender<HubEvent>,
    shutdown: CancellationToken,
    events_sent: AtomicU64,
}

impl LiveBroadcastHub {
    /// Create a hub with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    /// Create a hub buffering up to `capacity` events per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));

        Self {
            tx,
            shutdown: CancellationToken::new(),
            events_sent: AtomicU64::new(0),
        }
    }

    /// Join the hub
    ///
    /// Only events broadcast after this call are received.
    pub fn connect(&self) -> Result<Subscription, HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }

        let subscription = Subscription {
            rx: self.tx.subscribe(),
            shutdown: self.shutdown.clone(),
        };

        tracing::debug!(
            subscribers = self.subscriber_count(),
            "Subscriber connected"
        );

        Ok(subscription)
    }

    /// Number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Number of events broadcast so far
    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    /// Send an already-built event to all subscribers
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: HubEvent) -> Result<usize, HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }

        self.events_sent.fetch_add(1, Ordering::Relaxed);

        // send() only fails when nobody is connected, which is not an error for live delivery
        Ok(self.tx.send(event).unwrap_or(0))
    }

    /// Shut the hub down, ending every subscription
    pub fn close(&self) {
        self.shutdown.cancel();
        tracing::debug!("Broadcast hub closed");
    }

    /// Whether the hub has been shut down
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for LiveBroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastHub for LiveBroadcastHub {
    async fn send_to_all(&self, event_name: &str, message: &DeviceMessage) -> Result<(), HubError> {
        let event = HubEvent::new(event_name, message.clone())?;
        let receivers = self.publish(event)?;

        tracing::trace!(
            event = event_name,
            device_id = %message.device_id,
            receivers,
            "Event broadcast"
        );

        Ok(())
    }
}

/// A live subscriber's handle on the hub
///
/// Dropping it disconnects the subscriber.
pub struct Subscription {
    rx: broadcast::Receiver<HubEvent>,
    shutdown: CancellationToken,
}

impl Subscription {
    /// Wait for the next event
    ///
    /// [`RecvError::Lagged`] is informational: the subscription stays usable
    /// and the next call returns the oldest event still buffered.
    pub async fn recv(&mut self) -> Result<HubEvent, RecvError> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RecvError::Closed),
            result = self.rx.recv() => match result {
                Ok(event) => Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Err(RecvError::Lagged(skipped)),
                Err(broadcast::error::RecvError::Closed) => Err(RecvError::Closed),
            },
        }
    }
}
