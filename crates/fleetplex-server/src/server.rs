//! `FleetplexServer`: axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use fleetplex_core::ClientHandle;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::endpoint::run_endpoint_session;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::rpc::context::RpcContext;
use crate::rpc::registry::MethodRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::run_controller_session;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Controller method table.
    pub methods: Arc<MethodRegistry>,
    /// Registry and spillover shared with every handler.
    pub ctx: Arc<RpcContext>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle; `/metrics` is 404 without one.
    pub metrics: Option<PrometheusHandle>,
}

/// The broker server.
pub struct FleetplexServer {
    state: AppState,
}

impl FleetplexServer {
    /// Create a server. `methods` is usually filled by
    /// [`register_all`](crate::rpc::handlers::register_all).
    pub fn new(config: ServerConfig, methods: MethodRegistry, ctx: RpcContext) -> Self {
        Self {
            state: AppState {
                config: Arc::new(config),
                methods: Arc::new(methods),
                ctx: Arc::new(ctx),
                shutdown: Arc::new(ShutdownCoordinator::new()),
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(controller_upgrade))
            .route("/endpoint", get(endpoint_upgrade))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Bind and serve in the background until shutdown.
    ///
    /// Returns the bound address; port `0` picks a free one. The serve task
    /// is tracked by the shutdown coordinator.
    pub async fn listen(&self) -> std::io::Result<SocketAddr> {
        let config = &self.state.config;
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let token = self.state.shutdown.token();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "server stopped with error");
            }
        });
        self.state.shutdown.track(handle);
        info!(addr = %local_addr, "fleetplex broker listening");
        Ok(local_addr)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Controller method table.
    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.state.methods
    }

    /// Handler context.
    pub fn context(&self) -> &Arc<RpcContext> {
        &self.state.ctx
    }

    /// Connected controllers and attached clients.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.state.ctx.connections
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = &state.ctx.connections;
    Json(health::health_check(
        state.ctx.server_start_time,
        connections.controller_count(),
        connections.client_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /ws: controller channel.
async fn controller_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let active = state.ctx.connections.controller_count();
    if active >= state.config.max_connections {
        warn!(active, max = state.config.max_connections, "controller limit reached, refusing upgrade");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let heartbeat = state.config.heartbeat();
    let token = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_controller_session(socket, state.methods, state.ctx, heartbeat, token))
}

/// Query string of `/endpoint`.
#[derive(Debug, Default, Deserialize)]
struct EndpointQuery {
    handle: Option<String>,
}

/// Handle to attach an endpoint under: the requested one, else the peer address.
fn endpoint_handle(query: EndpointQuery, peer: SocketAddr) -> ClientHandle {
    match query.handle {
        Some(handle) if !handle.trim().is_empty() => ClientHandle::from(handle),
        _ => ClientHandle::from(peer.to_string()),
    }
}

/// GET /endpoint: managed-endpoint channel.
async fn endpoint_upgrade(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<EndpointQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let handle = endpoint_handle(query, peer);
    let registry = state.ctx.connections.clone();
    let heartbeat = state.config.heartbeat();
    let token = state.shutdown.token();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_endpoint_session(socket, handle, registry, heartbeat, token))
}
