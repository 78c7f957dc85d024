//! Durable queue configuration

use crate::error::{Error, Result};

/// Default number of deliveries before a message is dead-lettered
pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;

/// Queue connection options
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Connection string, e.g. `memory://local`
    pub connection: String,

    /// Destination queue name
    pub name: String,

    /// Deliveries after which an abandoned message is dead-lettered
    pub max_delivery_count: u32,

    /// Maximum queued messages (0 = unlimited)
    pub max_size: usize,
}

impl QueueConfig {
    /// Create a config for a connection string and queue name
    pub fn new(connection: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            name: name.into(),
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            max_size: 0,
        }
    }

    /// Set the max delivery count
    pub fn max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count.max(1);
        self
    }

    /// Set the queue size limit
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Check that the required values are present
    pub fn validate(&self) -> Result<()> {
        if self.connection.trim().is_empty() {
            return Err(Error::Config("queue connection string is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Config("queue name is required".into()));
        }
        Ok(())
    }
}
