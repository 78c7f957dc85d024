//! Events fanned out to live subscribers

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::message::DeviceMessage;

use super::error::HubError;

/// Event name used for relayed device messages
pub const DEVICE_MESSAGE_EVENT: &str = "ReceiveDeviceMessage";

/// An event broadcast to every subscriber
///
/// Cheap to clone: the message is shared and the encoded feed line is a
/// reference-counted `Bytes`, so every subscriber reuses one allocation.
#[derive(Debug, Clone)]
pub struct HubEvent {
    /// Event name (e.g. `ReceiveDeviceMessage`)
    pub name: Arc<str>,
    /// The relayed message
    pub message: Arc<DeviceMessage>,
    /// `{"event":..,"payload":..}` followed by a newline
    pub line: Bytes,
}

#[derive(Serialize)]
struct FeedLine<'a> {
    event: &'a str,
    payload: &'a DeviceMessage,
}

impl HubEvent {
    /// Build an event, encoding its feed line once
    pub fn new(name: &str, message: DeviceMessage) -> Result<Self, HubError> {
        let mut line = serde_json::to_vec(&FeedLine {
            event: name,
            payload: &message,
        })
        .map_err(|e| HubError::Encode(e.to_string()))?;
        line.push(b'\n');

        Ok(Self {
            name: Arc::from(name),
            message: Arc::new(message),
            line: Bytes::from(line),
        })
    }
}

impl std::fmt::Display for HubEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.message.device_id)
    }
}
