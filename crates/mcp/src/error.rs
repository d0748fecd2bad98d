//! Error types for sessions, transports and server groups.

use crate::protocol::{error_codes, JsonRpcError};
use std::time::Duration;
use switchyard_core::ServerId;

/// Result type for protocol operations.
pub type McpResult<T> = Result<T, McpError>;

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// The byte stream is unusable. Fatal to the session.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A single envelope or payload was malformed.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// Error response from the peer, propagated verbatim.
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Session disconnected")]
    Disconnected,

    #[error("Already connected: {0}")]
    AlreadyConnected(String),

    #[error("No servers connected")]
    NotConnected,

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),

    /// The tool ran but reported failure.
    #[error("Tool '{tool}' failed: {message}")]
    RemoteTool { tool: String, message: String },

    /// A local callback handler failed.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("{}", describe_aggregate(.0))]
    Aggregate(Vec<(ServerId, McpError)>),
}

fn describe_aggregate(failures: &[(ServerId, McpError)]) -> String {
    let parts: Vec<String> = failures
        .iter()
        .map(|(server, err)| format!("{}: {}", server, err))
        .collect();
    format!("{} server(s) failed: {}", failures.len(), parts.join("; "))
}

impl McpError {
    /// Errors after which the session cannot be used again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Disconnected)
    }

    /// Whether sending the same request again could succeed.
    /// Remote errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_invalid_params(&self) -> bool {
        matches!(self, Self::Remote { code, .. } if *code == error_codes::INVALID_PARAMS)
    }

    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Remote { code, .. } if *code == error_codes::METHOD_NOT_FOUND)
    }

    /// Error response body for a failed local handler.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Remote {
                code,
                message,
                data,
            } => JsonRpcError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::Protocol(message) => JsonRpcError::invalid_params(message.clone()),
            other => JsonRpcError::internal_error(other.to_string()),
        }
    }

    /// Collapse a list of per-server failures. `Ok` when empty.
    pub fn aggregate(failures: Vec<(ServerId, McpError)>) -> McpResult<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Self::Aggregate(failures))
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(err: JsonRpcError) -> Self {
        Self::Remote {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
