//! # fleetplex-core
//!
//! Foundation types shared by every fleetplex crate.
//!
//! - [`ids`]: branded `ClientHandle` and `ControllerId` newtypes
//! - [`session`]: the `ClientSession` contract a managed endpoint satisfies
//! - [`spillover`]: inline-or-file policy for command output
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;
pub mod session;
pub mod spillover;

pub use ids::{ClientHandle, ControllerId};
pub use session::{ClientSession, ClientSessionError};
pub use spillover::{CommandResult, ResultSpillover, SPILLOVER_THRESHOLD, SpilloverError};
