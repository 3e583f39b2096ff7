//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup step failed: {0}")]
    Startup(String),

    #[error("Credentials error: {0}")]
    Credentials(String),

    #[error("Core error: {0}")]
    Core(#[from] okto_core::CoreError),

    #[error("API error: {0}")]
    Api(#[from] okto_rest::ApiError),

    #[error("Stream error: {0}")]
    Ws(#[from] okto_ws::WsError),
}

pub type EngineResult<T> = Result<T, EngineError>;
