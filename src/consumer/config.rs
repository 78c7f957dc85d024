//! Consumer configuration

use std::time::Duration;

use crate::hub::DEVICE_MESSAGE_EVENT;

/// Deliveries processed at a time by one consumer
pub const MAX_CONCURRENT_DELIVERIES: usize = 1;

/// Queue consumer options
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Event name used when rebroadcasting
    pub event_name: String,

    /// Pause after a failed receive before trying again
    pub error_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            event_name: DEVICE_MESSAGE_EVENT.to_string(),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    /// Set the broadcast event name
    pub fn event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = name.into();
        self
    }

    /// Set the receive error backoff
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConsumerConfig::default();

        assert_eq!(config.event_name, "ReceiveDeviceMessage");
        assert_eq!(config.error_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_chaining() {
        let config = ConsumerConfig::default()
            .event_name("Telemetry")
            .error_backoff(Duration::from_millis(10));

        assert_eq!(config.event_name, "Telemetry");
        assert_eq!(config.error_backoff, Duration::from_millis(10));
    }
}
