//! Error types for the node client.

use thiserror::Error;

/// Result type alias for node client operations.
pub type NodeClientResult<T> = Result<T, NodeClientError>;

/// Errors from talking to a node agent.
#[derive(Debug, Error)]
pub enum NodeClientError {
    /// The call exceeded its deadline. Transient.
    #[error("node agent call timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// TCP connect or HTTP handshake failed. Transient.
    #[error("failed to reach node agent at {addr}: {reason}")]
    Unreachable { addr: String, reason: String },

    /// The agent has an instance with this ID but different parameters.
    #[error("instance parameters conflict on agent: {0}")]
    Conflict(String),

    /// The agent answered with an unexpected status.
    #[error("node agent returned {status}: {body}")]
    Agent { status: u16, body: String },

    #[error("failed to encode request body: {0}")]
    Serialize(String),

    #[error("failed to decode agent response: {0}")]
    Deserialize(String),
}

impl NodeClientError {
    /// Whether the reconciliation loops should retry next tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeClientError::Timeout(_) | NodeClientError::Unreachable { .. }
        )
    }
}
