//! REST transport error types.

use thiserror::Error;

/// Errors surfaced by the signed REST client.
///
/// Exchange application errors (non-zero `code` in the envelope) are NOT
/// errors at this layer: the envelope is returned to the caller, which
/// decides what a given code means for its operation.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error: status={status}, body={body}")]
    Http { status: u16, body: String },

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("API credentials rejected by the exchange")]
    CredentialInvalid,

    #[error("Unsupported request: {0}")]
    Unsupported(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Result type alias for REST operations.
pub type RestResult<T> = Result<T, ApiError>;
