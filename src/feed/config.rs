//! Live feed configuration

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Default TCP port for dashboard clients
pub const DEFAULT_FEED_PORT: u16 = 8081;

/// Live feed server options
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent clients (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY on client sockets
    pub tcp_nodelay: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_FEED_PORT)),
            max_connections: 0, // Unlimited
            tcp_nodelay: true,
        }
    }
}

impl FeedConfig {
    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the client limit
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set TCP_NODELAY
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }
}
