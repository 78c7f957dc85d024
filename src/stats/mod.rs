//! Statistics for the relay
//!
//! - [`RelayStats`]: lock-free ingestion counters, updated by every datagram
//!   handler
//! - [`RollingStats`]: subscriber-side window of recent messages used for
//!   dashboard metrics

pub mod metrics;
pub mod rolling;

pub use metrics::{RelayStats, StatsSnapshot};
pub use rolling::{RollingStats, DEFAULT_WINDOW_CAPACITY};
