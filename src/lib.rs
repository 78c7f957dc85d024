//! UDP device telemetry relay
//!
//! Devices send one JSON message per UDP datagram. The relay validates and
//! timestamps each message, hands it to a durable queue, and a background
//! consumer rebroadcasts everything in the queue to live dashboard
//! subscribers:
//!
//! ```text
//!   devices ──UDP──► DatagramIngestor ──► DurableForwarder ──► durable queue
//!                          │                                        │
//!                     RelayStats                              QueueConsumer
//!                                                                   │
//!   dashboards ◄──TCP── LiveFeedServer ◄── LiveBroadcastHub ◄───────┘
//!                                                │
//!                                           RollingStats
//! ```
//!
//! # Example
//!
//! ```no_run
//! use telemetry_relay::{QueueConfig, Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> telemetry_relay::Result<()> {
//!     let config = RelayConfig::new(QueueConfig::new("memory://local", "device-messages"));
//!     let relay = Relay::start(config).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     relay.shutdown().await
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod feed;
pub mod hub;
pub mod message;
pub mod queue;
pub mod relay;
pub mod report;
pub mod server;
pub mod stats;

pub use config::RelayConfig;
pub use consumer::{ConsumerConfig, ConsumerState, QueueConsumer};
pub use error::{Error, Result};
pub use feed::{FeedConfig, LiveFeedServer};
pub use hub::{BroadcastHub, LiveBroadcastHub};
pub use message::DeviceMessage;
pub use queue::{MemoryQueue, QueueConfig};
pub use relay::Relay;
pub use server::{DatagramIngestor, DurableForwarder, IngestorConfig};
pub use stats::{RelayStats, RollingStats};
