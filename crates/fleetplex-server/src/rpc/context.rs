//! Dependencies handed to every RPC handler.

use std::sync::Arc;
use std::time::Instant;

use fleetplex_core::ResultSpillover;

use crate::websocket::registry::ConnectionRegistry;

/// Shared context passed to every RPC handler.
pub struct RpcContext {
    /// Connected controllers and attached clients.
    pub connections: Arc<ConnectionRegistry>,
    /// Inline-or-file policy for command output.
    pub spillover: ResultSpillover,
    /// When the server started (for uptime calculation).
    pub server_start_time: Instant,
}

impl RpcContext {
    /// Build a context around an existing registry.
    pub fn new(connections: Arc<ConnectionRegistry>, spillover: ResultSpillover) -> Self {
        Self {
            connections,
            spillover,
            server_start_time: Instant::now(),
        }
    }
}
