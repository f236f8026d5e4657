//! Configuration for the sync client.

use dpsync_protocol::SyncRequest;
use std::time::Duration;

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`SyncClient`](crate::SyncClient).
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Address of the remote sync service.
    pub target: String,
    /// Subscription descriptor sent on every (re)connect.
    pub request: SyncRequest,
    /// Fixed delay between reconnect attempts.
    ///
    /// The delay does not grow with repeated failures.
    pub retry_delay: Duration,
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
}

impl SyncClientConfig {
    /// Creates a new configuration.
    pub fn new(target: impl Into<String>, request: SyncRequest) -> Self {
        Self {
            target: target.into(),
            request,
            retry_delay: DEFAULT_RETRY_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the reconnect delay.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for SyncClientConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:50051", SyncRequest::default())
    }
}
