//! Top-level relay configuration

use std::time::Duration;

use crate::consumer::ConsumerConfig;
use crate::error::{Error, Result};
use crate::feed::FeedConfig;
use crate::hub::DEFAULT_HUB_CAPACITY;
use crate::queue::QueueConfig;
use crate::report::DEFAULT_REPORT_INTERVAL;
use crate::server::IngestorConfig;
use crate::stats::DEFAULT_WINDOW_CAPACITY;

/// Everything needed to run the relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// UDP ingestion options
    pub ingestor: IngestorConfig,

    /// Durable queue connection
    pub queue: QueueConfig,

    /// Queue consumer options
    pub consumer: ConsumerConfig,

    /// Live feed options (`None` disables the feed)
    pub feed: Option<FeedConfig>,

    /// Events a hub subscriber may fall behind before skipping
    pub hub_capacity: usize,

    /// Messages kept by the dashboard window
    pub window_capacity: usize,

    /// Time between statistics reports
    pub stats_interval: Duration,

    /// Upper bound on graceful shutdown
    pub shutdown_timeout: Duration,
}

impl RelayConfig {
    /// Create a config with defaults around the required queue settings
    pub fn new(queue: QueueConfig) -> Self {
        Self {
            ingestor: IngestorConfig::default(),
            queue,
            consumer: ConsumerConfig::default(),
            feed: Some(FeedConfig::default()),
            hub_capacity: DEFAULT_HUB_CAPACITY,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            stats_interval: DEFAULT_REPORT_INTERVAL,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Set the ingestor options
    pub fn ingestor(mut self, ingestor: IngestorConfig) -> Self {
        self.ingestor = ingestor;
        self
    }

    /// Set the consumer options
    pub fn consumer(mut self, consumer: ConsumerConfig) -> Self {
        self.consumer = consumer;
        self
    }

    /// Set the live feed options
    pub fn feed(mut self, feed: Option<FeedConfig>) -> Self {
        self.feed = feed;
        self
    }

    /// Set the hub capacity
    pub fn hub_capacity(mut self, capacity: usize) -> Self {
        self.hub_capacity = capacity;
        self
    }

    /// Set the dashboard window capacity
    pub fn window_capacity(mut self, capacity: usize) -> Self {
        self.window_capacity = capacity;
        self
    }

    /// Set the statistics report interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Set the shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Check the configuration before anything is started
    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;

        if self.ingestor.forward_timeout.is_zero() {
            return Err(Error::Config("forward timeout must be positive".into()));
        }
        if self.hub_capacity == 0 {
            return Err(Error::Config("hub capacity must be positive".into()));
        }
        if self.window_capacity == 0 {
            return Err(Error::Config("window capacity must be positive".into()));
        }
        if self.stats_interval.is_zero() {
            return Err(Error::Config("stats interval must be positive".into()));
        }

        Ok(())
    }
}
