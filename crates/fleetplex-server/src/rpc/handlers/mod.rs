//! RPC handler modules and registration.

pub mod clients;
pub mod system;

use serde_json::Value;

use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodRegistry;

/// Register all RPC handlers with the registry.
///
/// This is the complete method table for the controller channel.
pub fn register_all(registry: &mut MethodRegistry) {
    // Clients
    registry.register("clients.enumerate", clients::EnumerateClientsHandler);
    registry.register("client.command", clients::ClientCommandHandler);

    // System
    registry.register("system.ping", system::PingHandler);
    registry.register("system.getInfo", system::GetInfoHandler);
}

/// Extract a required parameter from the params object.
pub(crate) fn require_param<'a>(params: Option<&'a Value>, key: &str) -> Result<&'a Value, RpcError> {
    params
        .and_then(|p| p.get(key))
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Missing required parameter: {key}"),
        })
}

/// Extract a required string parameter.
pub(crate) fn require_string_param(params: Option<&Value>, key: &str) -> Result<String, RpcError> {
    require_param(params, key)?
        .as_str()
        .map(ToOwned::to_owned)
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Parameter '{key}' must be a string"),
        })
}

/// Extract a required base64-encoded byte parameter.
pub(crate) fn require_bytes_param(params: Option<&Value>, key: &str) -> Result<Vec<u8>, RpcError> {
    let text = require_string_param(params, key)?;
    crate::codec::decode(&text).map_err(|e| RpcError::InvalidParams {
        message: format!("Parameter '{key}' must be base64: {e}"),
    })
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use std::sync::Arc;

    use fleetplex_core::ResultSpillover;
    use tempfile::TempDir;

    use crate::rpc::context::RpcContext;
    use crate::websocket::registry::ConnectionRegistry;

    /// Build an `RpcContext` with an empty registry and a throwaway spool dir.
    ///
    /// Keep the returned `TempDir` alive for as long as the context is used.
    pub fn make_test_context() -> (RpcContext, TempDir) {
        let spool = tempfile::tempdir().unwrap();
        let ctx = RpcContext::new(
            Arc::new(ConnectionRegistry::new()),
            ResultSpillover::new(spool.path()),
        );
        (ctx, spool)
    }
}
