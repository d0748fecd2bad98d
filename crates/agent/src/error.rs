//! Error types for model calls and the orchestrator.

use serde::Deserialize;
use switchyard_mcp::McpError;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Model API returned an error response.
    #[error("Model API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The model answered with something we cannot use.
    #[error("Invalid model response: {0}")]
    InvalidResponse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Protocol error: {0}")]
    Mcp(#[from] McpError),

    /// The model kept asking for tools past the round limit.
    #[error("Stopped after {rounds} model rounds without a final answer")]
    ToolLoopLimit { rounds: usize },
}

impl AgentError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::RateLimited { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Build an error from a non-success model API response.
    pub fn from_response(status: u16, body: &str, retry_after_secs: Option<u64>) -> Self {
        if status == 429 {
            return Self::RateLimited { retry_after_secs };
        }
        // both providers wrap the detail as {"error": {"message": ...}}
        match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => Self::Api {
                status,
                message: envelope.error.message,
            },
            Err(_) => Self::Api {
                status,
                message: body.trim().to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}
