//! Endpoint socket lifecycle: attach on upgrade, detach on disconnect.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use fleetplex_core::{ClientHandle, ClientSession};
use futures::StreamExt;
use metrics::gauge;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::protocol::EndpointFrame;
use super::remote::RemoteClientSession;
use crate::metrics::ENDPOINTS_ATTACHED;
use crate::websocket::heartbeat::{HeartbeatConfig, Inbound, Liveness, classify, run_outbound};
use crate::websocket::registry::ConnectionRegistry;

/// Outbound queue depth per endpoint.
const OUTBOUND_QUEUE: usize = 256;

/// Run an endpoint socket to completion.
///
/// The endpoint is attached under `handle` as soon as the socket is up, which
/// announces `client.connected` to every controller. When the socket closes,
/// pending commands fail as unreachable and the handle is detached, unless a
/// newer endpoint has since claimed it.
#[instrument(skip_all, fields(handle = %handle))]
pub async fn run_endpoint_session(
    ws: WebSocket,
    handle: ClientHandle,
    registry: Arc<ConnectionRegistry>,
    heartbeat: HeartbeatConfig,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(OUTBOUND_QUEUE);
    let remote = Arc::new(RemoteClientSession::new(handle.clone(), send_tx));
    let session: Arc<dyn ClientSession> = remote.clone();
    let liveness = Arc::new(Liveness::new());

    let outcome = registry.attach_client(handle.clone(), session.clone());
    gauge!(ENDPOINTS_ATTACHED).increment(1.0);
    info!(%handle, notified = outcome.delivered, "endpoint attached");

    let mut outbound = tokio::spawn(run_outbound(ws_tx, send_rx, liveness.clone(), heartbeat, shutdown.clone()));

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            exit = &mut outbound => {
                debug!(%handle, ?exit, "endpoint writer stopped");
                break;
            }
            () = shutdown.cancelled() => break,
        };
        let Some(Ok(msg)) = msg else { break };
        liveness.mark_alive();

        let text = match classify(msg) {
            Inbound::Text(text) => text,
            Inbound::Close => {
                info!(%handle, "endpoint sent close frame");
                break;
            }
            Inbound::Skip => continue,
        };

        match serde_json::from_str::<EndpointFrame>(&text) {
            Ok(frame) => {
                let _ = remote.complete(frame);
            }
            Err(e) => warn!(%handle, error = %e, "malformed endpoint frame"),
        }
    }

    remote.fail_all("endpoint disconnected");
    if registry.detach_client_session(&handle, &session).is_none() {
        debug!(%handle, "handle already detached or rebound");
    }
    outbound.abort();
    gauge!(ENDPOINTS_ATTACHED).decrement(1.0);
    info!(%handle, "endpoint detached");
}
