//! # fleetplex-server
//!
//! Axum HTTP + `WebSocket` broker between controllers and managed endpoints.
//!
//! - Controller channel (`/ws`): JSON RPC over `WebSocket` with lifecycle pushes
//! - Endpoint channel (`/endpoint`): attaches managed endpoints as client sessions
//! - [`websocket::registry::ConnectionRegistry`]: the single directory of both
//! - Large command output spills to the spool directory
//! - Health, Prometheus metrics, heartbeat and graceful shutdown

#![deny(unsafe_code)]

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod health;
pub mod metrics;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::FleetplexServer;
