//! System handlers: ping, getInfo.

use async_trait::async_trait;
use fleetplex_core::SPILLOVER_THRESHOLD;
use serde_json::Value;
use tracing::instrument;

use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodHandler;

/// Returns a pong with the current server timestamp.
pub struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    #[instrument(skip_all, fields(method = "system.ping"))]
    async fn handle(&self, _params: Option<Value>, _ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(serde_json::json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }))
    }
}

/// Returns broker version, uptime, and registry counts.
pub struct GetInfoHandler;

#[async_trait]
impl MethodHandler for GetInfoHandler {
    #[instrument(skip_all, fields(method = "system.getInfo"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": ctx.server_start_time.elapsed().as_secs(),
            "controllers": ctx.connections.controller_count(),
            "clients": ctx.connections.client_count(),
            "spoolDir": ctx.spillover.spool_dir().display().to_string(),
            "spilloverThreshold": SPILLOVER_THRESHOLD,
        }))
    }
}
