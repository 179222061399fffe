//! # fleetplex-agent
//!
//! `fleetplexd`: loads settings, wires the registry, spillover and method
//! table together, and runs the broker until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleetplex_core::ResultSpillover;
use fleetplex_core::logging::init_subscriber;
use fleetplex_settings::FleetplexSettings;
use fleetplex_server::config::ServerConfig;
use fleetplex_server::rpc::context::RpcContext;
use fleetplex_server::rpc::handlers::register_all;
use fleetplex_server::rpc::registry::MethodRegistry;
use fleetplex_server::server::FleetplexServer;
use fleetplex_server::websocket::registry::ConnectionRegistry;

/// How long in-flight sockets get to wind down after Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Fleetplex broker.
#[derive(Parser, Debug)]
#[command(name = "fleetplexd", about = "Broker between fleet controllers and managed endpoints")]
struct Cli {
    /// Settings file (defaults to `~/.fleetplex/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Directory for spilled command output (overrides settings).
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Log level filter, e.g. `info` or `fleetplex_server=debug` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Fold command-line flags over the loaded settings.
    fn apply(&self, settings: &mut FleetplexSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(dir) = &self.spool_dir {
            settings.spool.dir.clone_from(dir);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

fn server_config(settings: &FleetplexSettings) -> ServerConfig {
    let server = &settings.server;
    ServerConfig {
        host: server.host.clone(),
        port: server.port,
        max_connections: server.max_connections,
        heartbeat_interval_secs: server.heartbeat_interval_secs,
        heartbeat_timeout_secs: server.heartbeat_timeout_secs,
        max_message_size: server.max_message_size,
        command_timeout_secs: server.command_timeout_secs,
    }
}

/// Build the server from settings. Creates the spool directory if missing.
fn build_server(settings: &FleetplexSettings) -> Result<FleetplexServer> {
    let spillover = ResultSpillover::new(&settings.spool.dir);
    spillover
        .ensure_spool_dir()
        .with_context(|| format!("Failed to prepare spool directory {}", settings.spool.dir.display()))?;

    let config = server_config(settings);
    let mut methods = MethodRegistry::with_timeout(config.command_timeout());
    register_all(&mut methods);

    let ctx = RpcContext::new(Arc::new(ConnectionRegistry::new()), spillover);
    Ok(FleetplexServer::new(config, methods, ctx))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .config
        .clone()
        .unwrap_or_else(fleetplex_settings::settings_path);
    let mut settings = fleetplex_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    args.apply(&mut settings);
    fleetplex_settings::loader::validate(&settings).context("Invalid settings")?;

    init_subscriber(&settings.logging.level, settings.logging.json);

    let metrics_handle =
        fleetplex_server::metrics::install_recorder().context("Failed to install metrics recorder")?;
    let server = build_server(&settings)?.with_metrics(metrics_handle);

    let addr = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        %addr,
        spool_dir = %settings.spool.dir.display(),
        methods = server.methods().methods().len(),
        "fleetplexd listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("shutting down");
    server.shutdown().graceful_shutdown(Some(SHUTDOWN_GRACE)).await;
    tracing::info!("shutdown complete");
    Ok(())
}
