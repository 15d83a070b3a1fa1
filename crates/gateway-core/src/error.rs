//! Error Types

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Chat backend error (request creation, transport, bad response)
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend unavailable or not responding
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend rejected the tools parameter (function calling unsupported).
    /// Checked explicitly by the orchestrator fallback path.
    #[error("Backend does not support tool calling: {0}")]
    ToolsUnsupported(String),

    /// No tool backend owns the called tool name
    #[error("No connected tool backend exposes '{0}'")]
    ToolBackendNotFound(String),

    /// Remote tool invocation failed
    #[error("Tool invocation error: {0}")]
    ToolInvocation(String),

    /// User input rejected by validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Hard per-request ceiling on stream decoding exceeded
    #[error("Model stream timed out after {0} seconds")]
    StreamTimeout(u64),

    /// The model stream broke mid-flight
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    /// Tool-call ping-pong exceeded the per-turn cap
    #[error("Maximum tool iterations ({0}) reached")]
    MaxToolIterations(usize),

    /// Parse error (tool-call fragments, transcript synthesis)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::BackendUnavailable(_)
                | GatewayError::StreamInterrupted(_)
                | GatewayError::Io(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Backend(msg) => format!("The AI service encountered an error: {}", msg),
            GatewayError::BackendUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            GatewayError::ToolsUnsupported(_) => {
                "The selected model does not support tools; answering without them.".into()
            }
            GatewayError::ToolBackendNotFound(name) => {
                format!("No connected tool server provides '{}'.", name)
            }
            GatewayError::ToolInvocation(msg) => format!("Tool error: {}", msg),
            GatewayError::InvalidInput(msg) => format!("Invalid input: {}", msg),
            GatewayError::StreamTimeout(_) => {
                "The model took too long to respond. Please try again.".into()
            }
            GatewayError::MaxToolIterations(_) => {
                "The request took too many tool steps. Please try a simpler query.".into()
            }
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Other(err.to_string())
    }
}
