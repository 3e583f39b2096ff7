//! WebSocket error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Login rejected: code={code}, msg={msg}")]
    LoginRejected { code: String, msg: String },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WsResult<T> = Result<T, WsError>;
