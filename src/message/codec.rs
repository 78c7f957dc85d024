//! JSON wire codec for device messages
//!
//! Decoding distinguishes payloads that are not JSON at all
//! ([`DecodeError::InvalidEncoding`]) from JSON of the wrong shape
//! ([`DecodeError::InvalidSchema`]) so the two show up separately in logs.

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use super::DeviceMessage;

/// Error type for payload decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Not UTF-8, or not syntactically valid JSON
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    /// Valid JSON that does not describe a device message
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

impl DecodeError {
    /// Short label for structured logging
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::InvalidEncoding(_) => "invalid_encoding",
            DecodeError::InvalidSchema(_) => "invalid_schema",
        }
    }
}

/// Wire shape, accepting both camelCase and PascalCase field names
#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(rename = "deviceId", alias = "DeviceId")]
    device_id: Option<String>,

    // Emitter clocks are not trusted, so a bad value is ignored rather than rejected.
    #[serde(alias = "Timestamp")]
    timestamp: Option<Value>,

    #[serde(alias = "Data")]
    data: Option<String>,
}

/// Decode one datagram or queue body into a message
///
/// The timestamp is taken from the payload when it parses, otherwise it is
/// the current time. The source endpoint is always `None`.
pub fn decode(bytes: &[u8]) -> Result<DeviceMessage, DecodeError> {
    let text =
        std::str::from_utf8(bytes).map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;
    let text = text.trim_start_matches('\u{feff}');

    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidEncoding(e.to_string()))?;

    if !value.is_object() {
        return Err(DecodeError::InvalidSchema(format!(
            "expected a JSON object, got {}",
            json_kind(&value)
        )));
    }

    let wire: WireMessage =
        serde_json::from_value(value).map_err(|e| DecodeError::InvalidSchema(e.to_string()))?;

    let device_id = match wire.device_id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(DecodeError::InvalidSchema("missing deviceId".into())),
    };

    let timestamp = wire
        .timestamp
        .as_ref()
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);

    Ok(DeviceMessage {
        device_id,
        timestamp,
        data: wire.data.unwrap_or_default(),
        source_endpoint: None,
    })
}

/// Encode a message for the durable queue
///
/// The source endpoint is not part of the encoding.
pub fn encode(message: &DeviceMessage) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(message).map(Bytes::from)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    // Offset-less ISO-8601 is taken as UTC
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
