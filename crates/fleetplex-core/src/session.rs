//! The contract a managed endpoint session must satisfy.
//!
//! The broker never runs commands itself. Whatever owns the link to an
//! endpoint hands the broker an `Arc<dyn ClientSession>` when the endpoint
//! attaches, and the broker only ever calls [`ClientSession::execute`] on it.

use async_trait::async_trait;
use thiserror::Error;

/// Failure of a single `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientSessionError {
    /// The link to the endpoint broke before a result arrived.
    #[error("client unreachable: {reason}")]
    Unreachable {
        /// What went wrong on the link.
        reason: String,
    },
    /// The endpoint answered, but with an error instead of output.
    #[error("client rejected command: {message}")]
    Rejected {
        /// Message reported by the endpoint.
        message: String,
    },
}

impl ClientSessionError {
    /// Convenience constructor for [`ClientSessionError::Unreachable`].
    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }
}

/// One attached managed endpoint.
#[async_trait]
pub trait ClientSession: Send + Sync {
    /// Run `command` on the endpoint and return its raw output.
    async fn execute(&self, command: Vec<u8>) -> Result<Vec<u8>, ClientSessionError>;
}
