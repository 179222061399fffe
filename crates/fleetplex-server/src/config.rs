//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::websocket::heartbeat::HeartbeatConfig;

/// Configuration for the broker server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent controller connections.
    pub max_connections: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat timeout in seconds (close after this long without traffic).
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Upper bound on one RPC handler, `client.command` included.
    pub command_timeout_secs: u64,
}

impl ServerConfig {
    /// Ping cadence and silence limit for every socket.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::from_secs(self.heartbeat_interval_secs, self.heartbeat_timeout_secs)
    }

    /// Handler timeout for the method registry.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            command_timeout_secs: 300,
        }
    }
}
