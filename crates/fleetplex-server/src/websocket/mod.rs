//! Controller sockets: connection state, the shared registry, message
//! dispatch, session lifecycle, and heartbeat.

pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;
