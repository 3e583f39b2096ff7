//! Telemetry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Logging init error: {0}")]
    LoggingInit(String),

    #[error("Stats persistence error: {0}")]
    Persistence(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
