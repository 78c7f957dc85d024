//! Device telemetry messages
//!
//! A [`DeviceMessage`] is the unit of work flowing through the relay:
//!
//! ```text
//!   UDP datagram ──► codec::decode ──► DurableForwarder ──► queue
//!                                                             │
//!   subscribers ◄── LiveBroadcastHub ◄── QueueConsumer ◄──────┘
//! ```
//!
//! The wire format is a UTF-8 JSON object with `deviceId`, `timestamp` and
//! `data`. The source endpoint is socket-layer metadata and is never part of
//! the encoding.

pub mod codec;

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use codec::{decode, encode, DecodeError};

/// A single telemetry message from a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMessage {
    /// Emitter-supplied identifier (non-empty, opaque)
    pub device_id: String,

    /// Relay-assigned receive time
    pub timestamp: DateTime<Utc>,

    /// Opaque payload
    pub data: String,

    /// Sender address, only known on the ingestion side
    #[serde(skip)]
    pub source_endpoint: Option<SocketAddr>,
}

impl DeviceMessage {
    /// Create a message stamped with the current time
    pub fn new(device_id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            data: data.into(),
            source_endpoint: None,
        }
    }

    /// Set the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Stamp the message as received now from `source`
    pub fn stamp(&mut self, source: Option<SocketAddr>) {
        self.timestamp = Utc::now();
        self.source_endpoint = source;
    }
}
