//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the RPC server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Keep-alive ping interval in seconds.
    pub ping_interval_secs: u64,
    /// Deadline for sending one keep-alive ping, in seconds.
    pub ping_deadline_secs: u64,
    /// Capacity of the per-connection notification queue.
    pub notify_queue_capacity: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl ServerConfig {
    /// Keep-alive ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Deadline for one keep-alive ping send.
    pub fn ping_deadline(&self) -> Duration {
        Duration::from_secs(self.ping_deadline_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ping_interval_secs: 5,
            ping_deadline_secs: 5,
            notify_queue_capacity: 1000,
            max_message_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}
