//! Server configuration.

use std::time::Duration;

use entangle_core::CodecOptions;
use serde::{Deserialize, Serialize};

/// Configuration for the entangle server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Outbound frames buffered per session before it is considered broken.
    pub max_send_queue: usize,
    /// Interval between server-initiated pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a connection that has not answered a ping for this long.
    pub heartbeat_timeout_secs: u64,
    /// Deadline for one method call; expiry is reported as `CallError`.
    pub call_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// How long `stop` waits for sessions to close before forcing them.
    pub shutdown_timeout_secs: u64,
    /// Frame codec options; clients must use the same.
    pub codec: CodecOptions,
}

impl ServerConfig {
    /// Method call deadline.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Missing-pong deadline.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Session drain deadline on stop.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            call_timeout_secs: 60,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            shutdown_timeout_secs: 10,
            codec: CodecOptions::default(),
        }
    }
}
