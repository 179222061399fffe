//! Controller-facing RPC layer: wire types, errors, handlers and dispatch.

pub mod context;
pub mod errors;
pub mod handlers;
pub mod registry;
pub mod types;
