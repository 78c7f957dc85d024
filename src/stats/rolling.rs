//! Rolling window of recent messages for dashboard metrics
//!
//! Every query is computed over the current window when called; nothing is
//! cached between calls.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::message::DeviceMessage;

/// Default number of messages kept in the window
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;

/// Bounded window of the most recently recorded messages
///
/// Eviction is by insertion order, oldest first. Timestamps play no part in
/// it, so a backdated message cannot push the window past its bound.
#[derive(Debug, Clone)]
pub struct RollingStats {
    messages: VecDeque<DeviceMessage>,
    capacity: usize,
}

impl RollingStats {
    /// Create a window with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_CAPACITY)
    }

    /// Create a window holding at most `capacity` messages
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of messages kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, evicting the oldest past the bound
    pub fn record(&mut self, message: DeviceMessage) {
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            self.messages.pop_front();
        }
    }

    /// Drop every message
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Number of messages in the window
    pub fn total_messages(&self) -> usize {
        self.messages.len()
    }

    /// Distinct devices seen within `window` of now
    pub fn active_devices(&self, window: Duration) -> usize {
        self.active_devices_at(Utc::now(), window)
    }

    /// Distinct devices with a message newer than `now - window`
    pub fn active_devices_at(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.messages
            .iter()
            .filter(|m| m.timestamp > cutoff)
            .map(|m| m.device_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Timestamp of the most recently recorded message
    pub fn last_message_time(&self) -> Option<DateTime<Utc>> {
        self.messages.back().map(|m| m.timestamp)
    }

    /// Message rate over the last `window`
    ///
    /// `window` must be positive. A zero window divides by zero and the
    /// result is meaningless.
    pub fn messages_per_minute(&self, window: Duration) -> f64 {
        self.messages_per_minute_at(Utc::now(), window)
    }

    /// Message rate over the `window` ending at `now`; see [`Self::messages_per_minute`]
    pub fn messages_per_minute_at(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        debug_assert!(window > Duration::zero(), "window must be positive");

        let cutoff = now - window;
        let recent = self.messages.iter().filter(|m| m.timestamp > cutoff).count();
        let minutes = window.to_std().map_or(0.0, |w| w.as_secs_f64() / 60.0);
        if minutes == 0.0 {
            return 0.0;
        }

        recent as f64 / minutes
    }

    /// Up to `count` messages, newest first
    pub fn recent_messages(&self, count: usize) -> Vec<&DeviceMessage> {
        self.messages.iter().rev().take(count).collect()
    }

    /// Number of messages per device over the whole window
    pub fn message_counts_by_device(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for m in &self.messages {
            *counts.entry(m.device_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Latest timestamp per device over the whole window
    pub fn last_seen_by_device(&self) -> HashMap<String, DateTime<Utc>> {
        let mut seen: HashMap<String, DateTime<Utc>> = HashMap::new();
        for m in &self.messages {
            seen.entry(m.device_id.clone())
                .and_modify(|ts| *ts = (*ts).max(m.timestamp))
                .or_insert(m.timestamp);
        }
        seen
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new()
    }
}
