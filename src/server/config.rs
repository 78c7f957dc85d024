//! Ingestor configuration

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Default UDP port for device traffic
pub const DEFAULT_PORT: u16 = 8080;

/// Largest payload a UDP datagram can carry over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Ingestor configuration options
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum datagrams handled concurrently (0 = unlimited)
    pub max_in_flight: usize,

    /// Receive buffer size; longer datagrams are truncated
    pub recv_buffer_size: usize,

    /// Time allowed for one queue submission
    pub forward_timeout: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            max_in_flight: 10_000,
            recv_buffer_size: MAX_DATAGRAM_SIZE,
            forward_timeout: Duration::from_secs(5),
        }
    }
}

impl IngestorConfig {
    /// Create a config listening on `port` on all interfaces
    pub fn with_port(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the in-flight handler limit
    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Set the receive buffer size
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size.clamp(1, MAX_DATAGRAM_SIZE);
        self
    }

    /// Set the queue submission timeout
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = timeout;
        self
    }
}
