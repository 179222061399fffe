//! Settings types with compiled defaults.
//!
//! Field names are camelCase on disk to match the JSON settings file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FleetplexSettings {
    /// Listener and connection limits.
    pub server: ServerSettings,
    /// Where oversized command results are written.
    pub spool: SpoolSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

/// Listener and connection limits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent controller connections.
    pub max_connections: usize,
    /// Seconds between server pings.
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence before a socket is dropped.
    pub heartbeat_timeout_secs: u64,
    /// Largest accepted WebSocket frame, in bytes.
    pub max_message_size: usize,
    /// Upper bound on a single RPC call, including the endpoint round trip.
    pub command_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9870,
            max_connections: 64,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 16 * 1024 * 1024,
            command_timeout_secs: 300,
        }
    }
}

/// Spool directory for spilled results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SpoolSettings {
    /// Absolute path of the spool directory.
    pub dir: PathBuf,
}

impl Default for SpoolSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/run/fleetplex"),
        }
    }
}

/// Log output configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
