//! Telemetry relay server
//!
//! Run with: telemetry-relay --port 8080 --queue-connection memory://local --queue-name device-messages
//!
//! Every flag can also be set through a `RELAY_*` environment variable.
//! Type `q` and Enter to stop (interactive terminal), or press Ctrl+C.

use std::io::{BufRead, IsTerminal};
use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use telemetry_relay::{FeedConfig, IngestorConfig, QueueConfig, Relay, RelayConfig};

/// Relay UDP device telemetry through a durable queue to live dashboards
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// UDP port devices send to
    #[arg(short, long, env = "RELAY_PORT")]
    port: u16,

    /// Interface to bind the UDP socket on
    #[arg(long, env = "RELAY_BIND_IP", default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Durable queue connection string (e.g. memory://local)
    #[arg(long, env = "RELAY_QUEUE_CONNECTION")]
    queue_connection: String,

    /// Durable queue name
    #[arg(long, env = "RELAY_QUEUE_NAME")]
    queue_name: String,

    /// Deliveries of one message before it is dead-lettered
    #[arg(long, env = "RELAY_MAX_DELIVERY_COUNT", default_value = "10")]
    max_delivery_count: u32,

    /// Maximum datagrams handled at once (0 = unlimited)
    #[arg(long, env = "RELAY_MAX_IN_FLIGHT", default_value = "10000")]
    max_in_flight: usize,

    /// Queue submission timeout in milliseconds
    #[arg(long, env = "RELAY_FORWARD_TIMEOUT_MS", default_value = "5000")]
    forward_timeout_ms: u64,

    /// Address of the live dashboard feed
    #[arg(long, env = "RELAY_FEED_ADDR", default_value = "0.0.0.0:8081")]
    feed_addr: SocketAddr,

    /// Disable the live dashboard feed
    #[arg(long, env = "RELAY_NO_FEED")]
    no_feed: bool,

    /// Maximum dashboard clients (0 = unlimited)
    #[arg(long, env = "RELAY_FEED_MAX_CONNECTIONS", default_value = "0")]
    feed_max_connections: usize,

    /// Messages kept for dashboard statistics
    #[arg(long, env = "RELAY_WINDOW_CAPACITY", default_value = "1000")]
    window_capacity: usize,

    /// Seconds between statistics reports
    #[arg(long, env = "RELAY_STATS_INTERVAL", default_value = "5")]
    stats_interval: u64,

    /// Seconds allowed for graceful shutdown
    #[arg(long, env = "RELAY_SHUTDOWN_TIMEOUT", default_value = "10")]
    shutdown_timeout: u64,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        let queue = QueueConfig::new(self.queue_connection, self.queue_name)
            .max_delivery_count(self.max_delivery_count);

        let ingestor = IngestorConfig::default()
            .bind(SocketAddr::new(self.bind_ip, self.port))
            .max_in_flight(self.max_in_flight)
            .forward_timeout(Duration::from_millis(self.forward_timeout_ms));

        let feed = (!self.no_feed).then(|| {
            FeedConfig::default()
                .bind(self.feed_addr)
                .max_connections(self.feed_max_connections)
        });

        RelayConfig::new(queue)
            .ingestor(ingestor)
            .feed(feed)
            .window_capacity(self.window_capacity)
            .stats_interval(Duration::from_secs(self.stats_interval))
            .shutdown_timeout(Duration::from_secs(self.shutdown_timeout))
    }
}

/// Resolves when the operator asks to quit
async fn quit_requested() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    if !std::io::stdin().is_terminal() {
        ctrl_c.await;
        tracing::info!("Shutting down (Ctrl+C)");
        return;
    }

    // A blocking stdin read cannot be cancelled, so it gets a detached thread
    let (tx, quit_key) = tokio::sync::oneshot::channel::<()>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                    let _ = tx.send(());
                    return;
                }
                Ok(_) => {}
                Err(_) => return,
            }
        }
    });
    let quit_key = async {
        // stdin closed; Ctrl+C is the only way out
        if quit_key.await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutting down (Ctrl+C)"),
        _ = quit_key => tracing::info!("Shutting down"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telemetry_relay=info")),
        )
        .init();

    let mut relay = match Relay::start(args.into_config()).await {
        Ok(relay) => relay,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start relay");
            return ExitCode::FAILURE;
        }
    };

    if std::io::stdin().is_terminal() {
        println!("Relay running. Type 'q' and press Enter to stop.");
    }

    let mut failed = false;
    tokio::select! {
        _ = quit_requested() => {}
        result = relay.ingestor_stopped() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Ingestor stopped unexpectedly");
                failed = true;
            }
        }
    }

    if let Err(e) = relay.shutdown().await {
        tracing::error!(error = %e, "Shutdown incomplete");
        failed = true;
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
