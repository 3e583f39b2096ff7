//! Logging initialization and session trade statistics for okto.

pub mod error;
pub mod logging;
pub mod session_stats;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use session_stats::{DailyReport, SessionStats};
