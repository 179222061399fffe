//! Controller session lifecycle: one instance per connected controller,
//! from upgrade through disconnect.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use fleetplex_core::ControllerId;
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::connection::ControllerConnection;
use super::handler::respond;
use super::heartbeat::{HeartbeatConfig, Inbound, classify, run_outbound};
use super::registry::ConnectionRegistry;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::rpc::context::RpcContext;
use crate::rpc::registry::MethodRegistry;
use crate::rpc::types::RpcEvent;

/// First event on every controller socket.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";

/// Outbound queue depth per controller.
const OUTBOUND_QUEUE: usize = 1024;

/// Where a controller session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Socket accepted, not yet visible to broadcasts.
    Connecting,
    /// Registered; receives pushes and serves requests.
    Active,
    /// Unregistered. Terminal.
    Closed,
}

/// One controller's presence in the registry.
///
/// `Connecting -> Active` registers the connection, `-> Closed` unregisters
/// it. Dropping the session closes it.
pub struct ControllerSession {
    connection: Arc<ControllerConnection>,
    registry: Arc<ConnectionRegistry>,
    state: Mutex<SessionState>,
}

impl ControllerSession {
    /// Create a session in `Connecting`.
    pub fn new(connection: Arc<ControllerConnection>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            connection,
            registry,
            state: Mutex::new(SessionState::Connecting),
        }
    }

    /// Controller ID.
    pub fn id(&self) -> &ControllerId {
        &self.connection.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The outbound side of this controller.
    pub fn connection(&self) -> &Arc<ControllerConnection> {
        &self.connection
    }

    /// `Connecting -> Active`. Returns `false` from any other state.
    pub fn activate(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SessionState::Connecting {
            return false;
        }
        self.registry.register_controller(self.connection.clone());
        *state = SessionState::Active;
        true
    }

    /// Move to `Closed`. Returns `false` if already closed.
    ///
    /// Unregisters before refusing sends, so no broadcast is attempted on a
    /// closed connection.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SessionState::Closed {
            return false;
        }
        let _ = self.registry.unregister_controller(&self.connection.id);
        self.connection.mark_closed();
        *state = SessionState::Closed;
        true
    }
}

impl Drop for ControllerSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Run a controller socket to completion.
///
/// 1. Queues `connection.established`, then activates the session, so the
///    event is the first frame and the controller is registered by the time
///    it arrives
/// 2. Dispatches every incoming text frame on its own task
/// 3. Forwards responses and pushes, with periodic Ping frames
/// 4. Closes the session on disconnect; in-flight commands still finish
#[instrument(skip_all, fields(controller_id))]
pub async fn run_controller_session(
    ws: WebSocket,
    methods: Arc<MethodRegistry>,
    ctx: Arc<RpcContext>,
    heartbeat: HeartbeatConfig,
    shutdown: CancellationToken,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Arc<String>>(OUTBOUND_QUEUE);
    let connection = Arc::new(ControllerConnection::new(ControllerId::generate(), send_tx));
    let controller_id = connection.id.clone();
    let _ = tracing::Span::current().record("controller_id", controller_id.as_str());

    let session = ControllerSession::new(connection.clone(), ctx.connections.clone());
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let established = RpcEvent::new(
        CONNECTION_ESTABLISHED,
        Some(json!({ "controllerId": controller_id })),
    );
    let _ = connection.send_json(&established);
    let _ = session.activate();
    info!(%controller_id, "controller connected");

    let mut outbound = tokio::spawn(run_outbound(
        ws_tx,
        send_rx,
        connection.liveness().clone(),
        heartbeat,
        shutdown.clone(),
    ));

    loop {
        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            exit = &mut outbound => {
                debug!(%controller_id, ?exit, "controller writer stopped");
                break;
            }
            () = connection.closed() => {
                info!(%controller_id, "controller connection closed by broker");
                break;
            }
            () = shutdown.cancelled() => break,
        };
        let Some(Ok(msg)) = msg else { break };
        connection.liveness().mark_alive();

        let text = match classify(msg) {
            Inbound::Text(text) => text,
            Inbound::Close => {
                info!(%controller_id, "controller sent close frame");
                break;
            }
            Inbound::Skip => continue,
        };

        let methods = methods.clone();
        let ctx = ctx.clone();
        let conn = connection.clone();
        drop(tokio::spawn(async move {
            let _ = respond(text, &methods, &ctx, &conn).await;
        }));
    }

    let _ = session.close();
    outbound.abort();
    info!(%controller_id, dropped = connection.drop_count(), "controller disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    debug!(%controller_id, "controller session finished");
}
