//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent subscriber sessions.
    pub max_connections: usize,
    /// Per-write socket timeout; a subscriber that stops reading for longer
    /// is dropped.
    pub write_timeout: Duration,
    /// How long a new connection may take to send its subscribe frame.
    pub subscribe_timeout: Duration,
    /// How often the accept loop checks for shutdown.
    pub accept_poll_interval: Duration,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 256,
            write_timeout: Duration::from_secs(30),
            subscribe_timeout: Duration::from_secs(10),
            accept_poll_interval: Duration::from_millis(25),
        }
    }

    /// Sets the maximum concurrent sessions.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the subscribe timeout.
    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 50051)))
    }
}
