//! Datagram ingestion
//!
//! One UDP socket, one receive loop, one task per datagram:
//!
//! ```text
//!   recv_from ──► spawn ──► decode ──► RelayStats ──► DurableForwarder ──► queue
//!       ▲           │
//!       └───────────┘ (never waits on the handler)
//! ```

pub mod config;
pub mod forwarder;
pub mod listener;

pub use config::{IngestorConfig, DEFAULT_PORT, MAX_DATAGRAM_SIZE};
pub use forwarder::DurableForwarder;
pub use listener::DatagramIngestor;
