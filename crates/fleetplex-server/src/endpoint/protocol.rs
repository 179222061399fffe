//! Frames exchanged with a managed endpoint.

use serde::{Deserialize, Serialize};

/// One JSON frame on an endpoint socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EndpointFrame {
    /// Broker to endpoint: run this command.
    Command {
        /// Correlation ID, echoed in the reply.
        id: String,
        /// Raw command bytes.
        #[serde(with = "crate::codec::base64_bytes")]
        command: Vec<u8>,
    },
    /// Endpoint to broker: command output.
    Result {
        /// Correlation ID of the command.
        id: String,
        /// Raw output bytes.
        #[serde(with = "crate::codec::base64_bytes")]
        result: Vec<u8>,
    },
    /// Endpoint to broker: the command could not run.
    Error {
        /// Correlation ID of the command.
        id: String,
        /// Reason reported by the endpoint.
        message: String,
    },
}
