//! Client handlers: enumerate attached clients, run a command on one.

use async_trait::async_trait;
use fleetplex_core::{CommandResult, ResultSpillover, SPILLOVER_THRESHOLD, SpilloverError};
use metrics::counter;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use super::{require_bytes_param, require_string_param};
use crate::codec;
use crate::metrics::{SPILLOVER_BYTES_TOTAL, SPILLOVER_FILES_TOTAL};
use crate::rpc::context::RpcContext;
use crate::rpc::errors::RpcError;
use crate::rpc::registry::MethodHandler;

/// Lists every attached client handle, ascending.
pub struct EnumerateClientsHandler;

#[async_trait]
impl MethodHandler for EnumerateClientsHandler {
    #[instrument(skip_all, fields(method = "clients.enumerate"))]
    async fn handle(&self, _params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        Ok(json!({ "handles": ctx.connections.enumerate_handles() }))
    }
}

/// Runs a command on one client and returns its output.
///
/// Params: `{handle, command}` with `command` base64-encoded.
/// Result: `{result, filename}`; `result` is base64 output when it fits
/// inline, otherwise `filename` names the spill file.
pub struct ClientCommandHandler;

#[async_trait]
impl MethodHandler for ClientCommandHandler {
    #[instrument(skip_all, fields(method = "client.command", handle))]
    async fn handle(&self, params: Option<Value>, ctx: &RpcContext) -> Result<Value, RpcError> {
        let handle = require_string_param(params.as_ref(), "handle")?;
        let command = require_bytes_param(params.as_ref(), "command")?;
        let _ = tracing::Span::current().record("handle", handle.as_str());

        let session = ctx
            .connections
            .lookup_client(&handle)
            .ok_or_else(|| RpcError::UnknownClient {
                handle: handle.clone(),
            })?;

        let output = session.execute(command).await.map_err(|source| {
            warn!(handle, error = %source, "client command failed");
            RpcError::ClientUnreachable {
                handle: handle.clone(),
                source,
            }
        })?;

        let result = spill(&ctx.spillover, output).await?;
        debug!(handle, spilled = result.filename().is_some(), "client command completed");
        Ok(command_result_json(&result))
    }
}

type SpillOutcome = Result<CommandResult, SpilloverError>;

/// Apply the spillover policy off the async runtime.
///
/// The blocking task owns the output until it hands the result over. If
/// the caller is gone by then (handler timeout, dropped request), whichever
/// side ends up holding a spilled result removes its file.
async fn spill(spillover: &ResultSpillover, output: Vec<u8>) -> Result<CommandResult, RpcError> {
    // No I/O at or below the threshold.
    if output.len() <= SPILLOVER_THRESHOLD {
        return Ok(CommandResult::Inline(output));
    }

    let bytes = output.len() as u64;
    let (tx, rx) = oneshot::channel();
    let mut pending = PendingSpill {
        rx,
        spillover: spillover.clone(),
    };
    let worker = spillover.clone();
    drop(tokio::task::spawn_blocking(move || spill_blocking(&worker, output, tx)));

    let result = (&mut pending.rx)
        .await
        .map_err(|_| RpcError::Internal {
            message: "spillover task failed".into(),
        })?
        .inspect_err(|e| warn!(error = %e, "failed to spill command result"))?;

    counter!(SPILLOVER_FILES_TOTAL).increment(1);
    counter!(SPILLOVER_BYTES_TOTAL).increment(bytes);
    Ok(result)
}

fn spill_blocking(spillover: &ResultSpillover, output: Vec<u8>, tx: oneshot::Sender<SpillOutcome>) {
    if let Err(Ok(abandoned)) = tx.send(spillover.apply(output)) {
        discard_abandoned(spillover, &abandoned);
    }
}

fn discard_abandoned(spillover: &ResultSpillover, result: &CommandResult) {
    if spillover.discard(result) {
        warn!(
            filename = %result.filename().map(|p| p.display().to_string()).unwrap_or_default(),
            "command abandoned before its result was delivered, removed spill file"
        );
    }
}

/// Receiving end of a spill in progress.
struct PendingSpill {
    rx: oneshot::Receiver<SpillOutcome>,
    spillover: ResultSpillover,
}

impl Drop for PendingSpill {
    fn drop(&mut self) {
        // After close() the worker either fails to send and discards the
        // file itself, or already sent and the result is picked up here.
        self.rx.close();
        if let Ok(Ok(abandoned)) = self.rx.try_recv() {
            discard_abandoned(&self.spillover, &abandoned);
        }
    }
}

/// Wire shape of a `client.command` result.
pub fn command_result_json(result: &CommandResult) -> Value {
    match result {
        CommandResult::Inline(bytes) => json!({
            "result": codec::encode(bytes),
            "filename": "",
        }),
        CommandResult::Spilled(path) => json!({
            "result": "",
            "filename": path.display().to_string(),
        }),
    }
}
