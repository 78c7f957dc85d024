//! Periodic statistics report and the in-process dashboard subscriber

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::hub::{LiveBroadcastHub, RecvError};
use crate::message::DeviceMessage;
use crate::queue::MemoryQueue;
use crate::stats::{RelayStats, RollingStats, StatsSnapshot};

/// Default time between reports
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Messages listed in each report
pub const RECENT_MESSAGES_SHOWN: usize = 5;

const ACTIVE_DEVICE_WINDOW_MINUTES: i64 = 5;
const RATE_WINDOW_MINUTES: i64 = 1;

/// One report's worth of figures
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub ingest: StatsSnapshot,
    pub queue_depth: usize,
    pub queue_in_flight: usize,
    pub dashboard_messages: usize,
    pub active_devices: usize,
    pub messages_per_minute: f64,
    pub recent: Vec<DeviceMessage>,
}

impl StatsReport {
    /// Gather figures at `now`
    pub fn build(
        ingest: StatsSnapshot,
        queue_depth: usize,
        queue_in_flight: usize,
        rolling: &RollingStats,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            ingest,
            queue_depth,
            queue_in_flight,
            dashboard_messages: rolling.total_messages(),
            active_devices: rolling.active_devices_at(now, chrono::Duration::minutes(ACTIVE_DEVICE_WINDOW_MINUTES)),
            messages_per_minute: rolling.messages_per_minute_at(now, chrono::Duration::minutes(RATE_WINDOW_MINUTES)),
            recent: rolling
                .recent_messages(RECENT_MESSAGES_SHOWN)
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    /// Emit the report as log events
    pub fn log(&self) {
        let last_message = self
            .ingest
            .last_message_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());

        tracing::info!(
            total = self.ingest.total_messages,
            forwarded = self.ingest.forwarded,
            forward_failures = self.ingest.forward_failures,
            decode_failures = self.ingest.decode_failures,
            dropped = self.ingest.dropped,
            queue_depth = self.queue_depth,
            queue_in_flight = self.queue_in_flight,
            last_message = %last_message,
            messages_per_second = self.ingest.messages_per_second(),
            "Message statistics"
        );

        tracing::info!(
            window = self.dashboard_messages,
            active_devices = self.active_devices,
            messages_per_minute = self.messages_per_minute,
            "Dashboard statistics"
        );

        for message in &self.recent {
            tracing::info!(
                device_id = %message.device_id,
                timestamp = %message.timestamp.format("%H:%M:%S"),
                data = %message.data,
                "Recent message"
            );
        }
    }
}

/// Log a [`StatsReport`] every `interval` until `shutdown` is cancelled
pub fn spawn_stats_reporter(
    stats: Arc<RelayStats>,
    queue: MemoryQueue,
    rolling: Arc<RwLock<RollingStats>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let queue_depth = queue.len().await;
            let queue_in_flight = queue.in_flight().await;
            let report = {
                let rolling = rolling.read().await;
                StatsReport::build(stats.snapshot(), queue_depth, queue_in_flight, &rolling, Utc::now())
            };
            report.log();
        }

        tracing::debug!("Stats reporter stopped");
    })
}

/// Feed every hub event into `rolling` until the hub closes or `shutdown` is cancelled
pub fn spawn_rolling_subscriber(
    hub: &LiveBroadcastHub,
    rolling: Arc<RwLock<RollingStats>>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let mut subscription = hub.connect()?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = subscription.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Dashboard subscriber lagging, events skipped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            rolling.write().await.record(DeviceMessage::clone(&event.message));
        }

        tracing::debug!("Dashboard subscriber stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::hub::{BroadcastHub, DEVICE_MESSAGE_EVENT};

    #[test]
    fn test_build_report() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut rolling = RollingStats::new();

        for i in 0..8 {
            let at = now - chrono::Duration::seconds(10 * (8 - i));
            rolling.record(DeviceMessage::new(format!("d{}", i % 3), format!("m{}", i)).at(at));
        }
        rolling.record(DeviceMessage::new("old", "stale").at(now - chrono::Duration::minutes(30)));

        let ingest = StatsSnapshot {
            total_messages: 9,
            ..Default::default()
        };
        let report = StatsReport::build(ingest, 4, 1, &rolling, now);

        assert_eq!(report.ingest.total_messages, 9);
        assert_eq!(report.queue_depth, 4);
        assert_eq!(report.queue_in_flight, 1);
        assert_eq!(report.dashboard_messages, 9);
        assert_eq!(report.active_devices, 3);
        assert_eq!(report.messages_per_minute, 5.0);

        assert_eq!(report.recent.len(), RECENT_MESSAGES_SHOWN);
        assert_eq!(report.recent[0].device_id, "old");
        assert_eq!(report.recent[1].data, "m7");
    }

    #[test]
    fn test_build_report_empty() {
        let report = StatsReport::build(StatsSnapshot::default(), 0, 0, &RollingStats::new(), Utc::now());

        assert_eq!(report.dashboard_messages, 0);
        assert_eq!(report.active_devices, 0);
        assert!(report.recent.is_empty());
        report.log();
    }

    #[tokio::test]
    async fn test_rolling_subscriber_records_events() {
        let hub = LiveBroadcastHub::new();
        let rolling = Arc::new(RwLock::new(RollingStats::new()));
        let handle = spawn_rolling_subscriber(&hub, Arc::clone(&rolling), CancellationToken::new()).unwrap();

        for i in 0..3 {
            hub.send_to_all(DEVICE_MESSAGE_EVENT, &DeviceMessage::new("d1", format!("m{}", i)))
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while rolling.read().await.total_messages() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        hub.close();
        handle.await.unwrap();

        let rolling = rolling.read().await;
        assert_eq!(rolling.recent_messages(1)[0].data, "m2");
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = spawn_stats_reporter(
            Arc::new(RelayStats::new()),
            MemoryQueue::new("q"),
            Arc::new(RwLock::new(RollingStats::new())),
            Duration::from_millis(10),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
