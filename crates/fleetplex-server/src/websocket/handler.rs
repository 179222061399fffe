//! WebSocket message dispatch: parses incoming text as `RpcRequest`, routes
//! it through the `MethodRegistry`, and queues the response.

use std::path::PathBuf;
use std::sync::Arc;

use fleetplex_core::CommandResult;
use tracing::{debug, instrument, warn};

use super::connection::ControllerConnection;
use crate::rpc::context::RpcContext;
use crate::rpc::errors;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::{RpcRequest, RpcResponse};

/// Result of handling a WebSocket message.
pub struct HandleResult {
    /// Serialized JSON response to send back.
    pub response_json: String,
    /// The RPC method that was called (empty if parse failed).
    pub method: String,
    /// Typed response.
    pub response: RpcResponse,
}

/// Parse, dispatch, and serialize one incoming message.
#[instrument(skip_all, fields(method))]
pub async fn handle_message(message: &str, registry: &MethodRegistry, ctx: &RpcContext) -> HandleResult {
    let request: RpcRequest = match serde_json::from_str(message) {
        Ok(r) => r,
        Err(e) => {
            warn!("invalid JSON received");
            let resp = RpcResponse::error("unknown", errors::INVALID_PARAMS, format!("Invalid JSON: {e}"));
            return HandleResult {
                response_json: serialize(&resp),
                method: String::new(),
                response: resp,
            };
        }
    };

    let method = request.method.clone();
    let _ = tracing::Span::current().record("method", method.as_str());
    debug!(method, id = %request.id, "dispatching RPC");

    if !registry.has_method(&method) {
        warn!(method, "unknown RPC method");
    }

    let response = registry.dispatch(request, ctx).await;
    HandleResult {
        response_json: serialize(&response),
        method,
        response,
    }
}

/// Handle one message and queue the response on `connection`.
///
/// Waits for queue space while the controller is live. If the controller
/// is gone by the time the response is ready, nobody will ever learn the
/// name of a spill file it references, so that file is removed. Returns
/// whether the response was queued.
pub async fn respond(
    message: String,
    registry: &MethodRegistry,
    ctx: &RpcContext,
    connection: &ControllerConnection,
) -> bool {
    let result = handle_message(&message, registry, ctx).await;
    if connection.send_response(Arc::new(result.response_json)).await {
        return true;
    }
    if !connection.is_closed() {
        return false;
    }

    debug!(controller_id = %connection.id, method = %result.method, "response dropped, controller gone");
    if let Some(filename) = result.response.spilled_filename() {
        let abandoned = CommandResult::Spilled(PathBuf::from(filename));
        if ctx.spillover.discard(&abandoned) {
            warn!(
                controller_id = %connection.id,
                filename,
                "controller closed before result delivery, removed spill file"
            );
        }
    }
    false
}

fn serialize(response: &RpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to serialize response");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleetplex_core::{ClientSession, ClientSessionError, ControllerId, SPILLOVER_THRESHOLD};
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use crate::rpc::handlers::register_all;
    use crate::rpc::handlers::test_helpers::make_test_context;

    struct Fixed(Vec<u8>);

    #[async_trait]
    impl ClientSession for Fixed {
        async fn execute(&self, _command: Vec<u8>) -> Result<Vec<u8>, ClientSessionError> {
            Ok(self.0.clone())
        }
    }

    fn methods() -> MethodRegistry {
        let mut reg = MethodRegistry::new();
        register_all(&mut reg);
        reg
    }

    fn connection() -> (ControllerConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (ControllerConnection::new(ControllerId::from("ctl_t"), tx), rx)
    }

    #[tokio::test]
    async fn invalid_json_yields_invalid_params() {
        let (ctx, _spool) = make_test_context();
        let result = handle_message("{not json", &methods(), &ctx).await;
        assert!(result.method.is_empty());
        let v: Value = serde_json::from_str(&result.response_json).unwrap();
        assert_eq!(v["id"], "unknown");
        assert_eq!(v["error"]["code"], errors::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (ctx, _spool) = make_test_context();
        let result = handle_message(r#"{"id":"r1","method":"clients.purge"}"#, &methods(), &ctx).await;
        assert_eq!(result.method, "clients.purge");
        assert_eq!(result.response.error.unwrap().code, errors::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn enumerate_roundtrip() {
        let (ctx, _spool) = make_test_context();
        let _ = ctx.connections.register_client("pc1".into(), Arc::new(Fixed(Vec::new())));
        let result = handle_message(r#"{"id":"r2","method":"clients.enumerate"}"#, &methods(), &ctx).await;
        let v: Value = serde_json::from_str(&result.response_json).unwrap();
        assert_eq!(v["id"], "r2");
        assert_eq!(v["success"], true);
        assert_eq!(v["result"]["handles"], json!(["pc1"]));
    }

    #[tokio::test]
    async fn respond_queues_response() {
        let (ctx, _spool) = make_test_context();
        let (conn, mut rx) = connection();
        let queued = respond(r#"{"id":"p","method":"system.ping"}"#.into(), &methods(), &ctx, &conn).await;
        assert!(queued);
        let v: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(v["result"]["pong"], true);
    }

    #[tokio::test]
    async fn abandoned_spill_file_is_removed() {
        let (ctx, spool) = make_test_context();
        let _ = ctx
            .connections
            .register_client("pc1".into(), Arc::new(Fixed(vec![9; SPILLOVER_THRESHOLD + 10])));
        let (conn, _rx) = connection();
        conn.mark_closed();

        let request = json!({
            "id": "c1",
            "method": "client.command",
            "params": {"handle": "pc1", "command": crate::codec::encode(b"dump")},
        })
        .to_string();
        assert!(!respond(request, &methods(), &ctx, &conn).await);
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn full_queue_delays_spilled_response_without_losing_it() {
        let (ctx, spool) = make_test_context();
        let _ = ctx
            .connections
            .register_client("pc1".into(), Arc::new(Fixed(vec![9; SPILLOVER_THRESHOLD + 10])));
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ControllerConnection::new(ControllerId::from("ctl_t"), tx);
        assert!(conn.send(Arc::new("push".into())));

        let request = json!({
            "id": "c1",
            "method": "client.command",
            "params": {"handle": "pc1", "command": crate::codec::encode(b"dump")},
        })
        .to_string();
        let registry = methods();
        let (queued, (first, second)) = tokio::join!(respond(request, &registry, &ctx, &conn), async {
            (rx.recv().await.unwrap(), rx.recv().await.unwrap())
        });

        assert!(queued);
        assert_eq!(first.as_str(), "push");
        let v: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(v["id"], "c1");
        assert!(std::path::Path::new(v["result"]["filename"].as_str().unwrap()).exists());
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn delivered_spill_file_is_kept() {
        let (ctx, spool) = make_test_context();
        let _ = ctx
            .connections
            .register_client("pc1".into(), Arc::new(Fixed(vec![9; SPILLOVER_THRESHOLD + 10])));
        let (conn, mut rx) = connection();

        let request = json!({
            "id": "c1",
            "method": "client.command",
            "params": {"handle": "pc1", "command": crate::codec::encode(b"dump")},
        })
        .to_string();
        assert!(respond(request, &methods(), &ctx, &conn).await);
        let v: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let filename = v["result"]["filename"].as_str().unwrap();
        assert!(std::path::Path::new(filename).exists());
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 1);
    }
}
