use serde_json::Value;
use thiserror::Error;

/// Failure of a backend collaborator call. Session resolution itself never
/// fails; everything that can go wrong lives in the exchange with the
/// backend or the token verifier.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend answered with a non-2xx status and (usually) a structured
    /// error body.
    #[error("backend error {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        details: Option<Value>,
    },
    /// The backend could not be reached or the response body could not be
    /// read.
    #[error("backend transport error: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn code(&self) -> &str {
        match self {
            BackendError::Api { code, .. } => code,
            BackendError::Transport(_) => codes::CONNECTION_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BackendError::Api { message, .. } => message,
            BackendError::Transport(message) => message,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            BackendError::Api { details, .. } => details.as_ref(),
            BackendError::Transport(_) => None,
        }
    }
}

/// Machine-readable error codes shared between the runtime and tool results.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const INVALID_SESSION_TOKEN: &str = "invalid_session_token";
    pub const CONNECTION_ERROR: &str = "connection_error";
    pub const BACKEND_ERROR: &str = "backend_error";
}
