//! Tool errors

use browser::BrowserError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool already registered: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Browser(#[from] BrowserError),

    /// Refused by a circuit breaker without running
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("tool execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ToolError::InvalidArguments(message.into())
    }

    /// Bad input from the caller; retrying the same call can't help
    pub fn is_invalid_arguments(&self) -> bool {
        matches!(self, ToolError::InvalidArguments(_))
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(e: serde_json::Error) -> Self {
        ToolError::Failed(format!("failed to encode tool output: {}", e))
    }
}
