//! Error types for the relay

use std::net::SocketAddr;
use std::time::Duration;

use crate::consumer::ConsumerState;
use crate::hub::HubError;
use crate::message::DecodeError;
use crate::queue::QueueError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Relay error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The ingestion socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind
        addr: SocketAddr,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload could not be decoded into a device message
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Message could not be serialized for the queue
    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Durable queue operation failed
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Queue submission did not finish in time
    #[error("Queue submission timed out after {0:?}")]
    ForwardTimeout(Duration),

    /// Broadcast to live subscribers failed
    #[error("Broadcast error: {0}")]
    Hub(#[from] HubError),

    /// Message processing panicked
    #[error("Processing panicked: {0}")]
    Panicked(String),

    /// Graceful shutdown did not finish in time
    #[error("Shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    /// Operation not valid in the current consumer state
    #[error("Invalid consumer state: {0:?}")]
    InvalidState(ConsumerState),
}
