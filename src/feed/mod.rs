//! Live TCP feed for dashboard clients
//!
//! Each client gets its own hub subscription and receives every event as one
//! line of JSON:
//!
//! ```text
//! {"event":"ReceiveDeviceMessage","payload":{"deviceId":"..","timestamp":"..","data":".."}}
//! ```
//!
//! Clients that fall behind skip events; nothing a client does can slow the
//! hub down.

pub mod config;
pub mod connection;
pub mod server;

pub use config::{FeedConfig, DEFAULT_FEED_PORT};
pub use connection::{write_event, FeedConnection};
pub use server::LiveFeedServer;
