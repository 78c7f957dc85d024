//! Ingestion counters shared by all datagram handlers

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

const NEVER: i64 = i64::MIN;

/// Process-wide ingestion counters
///
/// Constructed once and shared by `Arc`. Every field is updated without
/// locking. `last_message_time` is a plain store, so under concurrent
/// handlers the last writer wins even if it is not the latest message.
#[derive(Debug)]
pub struct RelayStats {
    started_at: Instant,
    total_messages: AtomicU64,
    last_message_millis: AtomicI64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
    decode_failures: AtomicU64,
    dropped: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_messages: AtomicU64::new(0),
            last_message_millis: AtomicI64::new(NEVER),
            forwarded: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Count a successfully decoded message received at `at`
    pub fn record_received(&self, at: DateTime<Utc>) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.last_message_millis
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    /// Count a message accepted by the durable queue
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a message the durable queue did not accept
    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a datagram that failed to decode
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a datagram dropped because too many were in flight
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Total messages received
    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    /// Time of the last received message, if any
    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        match self.last_message_millis.load(Ordering::Relaxed) {
            NEVER => None,
            millis => DateTime::from_timestamp_millis(millis),
        }
    }

    /// Take a consistent-enough copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_messages: self.total_messages(),
            last_message_time: self.last_message_time(),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed(),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`RelayStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Messages received (decoded), regardless of forward outcome
    pub total_messages: u64,
    /// Time of the last received message
    pub last_message_time: Option<DateTime<Utc>>,
    /// Messages accepted by the durable queue
    pub forwarded: u64,
    /// Messages the durable queue rejected or timed out on
    pub forward_failures: u64,
    /// Datagrams that failed to decode
    pub decode_failures: u64,
    /// Datagrams dropped at the in-flight bound
    pub dropped: u64,
    /// Time since the counters were created
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// Average receive rate since start
    pub fn messages_per_second(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.total_messages as f64 / secs
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_stats() {
        let stats = RelayStats::new();

        assert_eq!(stats.total_messages(), 0);
        assert!(stats.last_message_time().is_none());

        let snap = stats.snapshot();
        assert_eq!(snap.forwarded, 0);
        assert_eq!(snap.forward_failures, 0);
        assert_eq!(snap.decode_failures, 0);
        assert_eq!(snap.dropped, 0);
    }

    #[test]
    fn test_record_received() {
        let stats = RelayStats::new();
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();

        stats.record_received(at);

        assert_eq!(stats.total_messages(), 1);
        assert_eq!(stats.last_message_time(), Some(at));
    }

    #[test]
    fn test_outcome_counters_are_independent() {
        let stats = RelayStats::new();

        stats.record_received(Utc::now());
        stats.record_forward_failure();
        stats.record_decode_failure();
        stats.record_dropped();

        let snap = stats.snapshot();
        assert_eq!(snap.total_messages, 1);
        assert_eq!(snap.forwarded, 0);
        assert_eq!(snap.forward_failures, 1);
        assert_eq!(snap.decode_failures, 1);
        assert_eq!(snap.dropped, 1);
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(RelayStats::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_received(Utc::now());
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(stats.total_messages(), 8000);
        assert!(stats.last_message_time().is_some());
    }

    #[test]
    fn test_messages_per_second_zero_uptime() {
        let snap = StatsSnapshot {
            total_messages: 10,
            ..Default::default()
        };
        assert_eq!(snap.messages_per_second(), 0.0);
    }

    #[test]
    fn test_messages_per_second() {
        let snap = StatsSnapshot {
            total_messages: 100,
            uptime: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(snap.messages_per_second(), 10.0);
    }
}
