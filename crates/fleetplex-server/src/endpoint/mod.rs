//! Managed endpoint sockets: each connected endpoint becomes a client
//! session in the registry.

pub mod protocol;
pub mod remote;
pub mod socket;

pub use remote::RemoteClientSession;
pub use socket::run_endpoint_session;
