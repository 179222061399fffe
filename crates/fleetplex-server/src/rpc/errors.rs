//! RPC error codes and error type.

use fleetplex_core::{ClientSessionError, SpilloverError};

use crate::rpc::types::RpcErrorBody;

// ── Error code constants ────────────────────────────────────────────

/// Invalid or missing parameters.
pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Method not found in the registry.
pub const METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
/// Handler did not finish within the command timeout.
pub const TIMEOUT: &str = "TIMEOUT";
/// Handle is not currently registered.
pub const UNKNOWN_CLIENT: &str = "UNKNOWN_CLIENT";
/// The endpoint failed to produce a result.
pub const CLIENT_UNREACHABLE: &str = "CLIENT_UNREACHABLE";
/// A large result could not be written to the spool directory.
pub const SPILLOVER_FAILED: &str = "SPILLOVER_FAILED";

/// RPC error type returned by handlers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Required parameter missing or wrong type.
    #[error("{message}")]
    InvalidParams {
        /// Description of what is wrong.
        message: String,
    },

    /// No client is registered under `handle`.
    #[error("unknown client '{handle}'")]
    UnknownClient {
        /// The handle the controller asked for.
        handle: String,
    },

    /// The client's `execute` failed.
    #[error("client '{handle}' unreachable: {source}")]
    ClientUnreachable {
        /// The handle the command was sent to.
        handle: String,
        /// What the session reported.
        source: ClientSessionError,
    },

    /// The result was too large to inline and could not be spilled.
    #[error("{0}")]
    Spillover(#[from] SpilloverError),

    /// Internal server error.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

impl RpcError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::UnknownClient { .. } => UNKNOWN_CLIENT,
            Self::ClientUnreachable { .. } => CLIENT_UNREACHABLE,
            Self::Spillover(_) => SPILLOVER_FAILED,
            Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Convert to the wire-format error body.
    pub fn to_error_body(&self) -> RpcErrorBody {
        RpcErrorBody {
            code: self.code().to_owned(),
            message: self.to_string(),
            details: match self {
                Self::UnknownClient { handle } | Self::ClientUnreachable { handle, .. } => {
                    Some(serde_json::json!({ "handle": handle }))
                }
                _ => None,
            },
        }
    }
}
