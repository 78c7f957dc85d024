//! Hand-off from the ingestor to the durable queue

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::message::{self, DeviceMessage};
use crate::queue::QueueSender;

/// Submits decoded messages to the durable queue
///
/// Failures are logged and returned, never retried. A message the queue does
/// not accept is lost.
pub struct DurableForwarder<Q: QueueSender> {
    queue: Arc<Q>,
    timeout: Duration,
}

impl<Q: QueueSender> DurableForwarder<Q> {
    /// Create a forwarder with a submission timeout
    pub fn new(queue: Arc<Q>, timeout: Duration) -> Self {
        Self { queue, timeout }
    }

    /// The underlying queue
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Stamp `message` as received from `source` and submit it
    pub async fn forward(
        &self,
        mut message: DeviceMessage,
        source: Option<SocketAddr>,
    ) -> Result<()> {
        message.stamp(source);
        self.submit(&message).await
    }

    /// Submit an already stamped message as is
    pub async fn submit(&self, message: &DeviceMessage) -> Result<()> {
        let body = message::encode(message).map_err(|e| {
            tracing::warn!(device_id = %message.device_id, error = %e, "Failed to encode message");
            Error::from(e)
        })?;

        let result = match tokio::time::timeout(self.timeout, self.queue.send(body)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Queue(e)),
            Err(_) => Err(Error::ForwardTimeout(self.timeout)),
        };

        match &result {
            Ok(()) => tracing::debug!(
                device_id = %message.device_id,
                timestamp = %message.timestamp,
                "Message forwarded"
            ),
            Err(e) => tracing::warn!(
                device_id = %message.device_id,
                error = %e,
                "Failed to forward message"
            ),
        }

        result
    }
}
