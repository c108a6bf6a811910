//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use shoal_protocol::DEFAULT_MAX_PAYLOAD;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_addr: SocketAddr,

    /// Interval between keepalive pings on each connection.
    pub keepalive_interval: Duration,

    /// Maximum accepted frame payload length, in bytes.
    pub max_payload: u64,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Maximum size of the HTTP upgrade request head, in bytes.
    pub max_request_head: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            keepalive_interval: Duration::from_secs(15),
            max_payload: DEFAULT_MAX_PAYLOAD,
            max_connections: 100,
            max_request_head: 8 * 1024,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builder: set keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Builder: set max payload size.
    pub fn with_max_payload(mut self, max: u64) -> Self {
        self.max_payload = max;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set max request head size.
    pub fn with_max_request_head(mut self, max: usize) -> Self {
        self.max_request_head = max;
        self
    }
}
