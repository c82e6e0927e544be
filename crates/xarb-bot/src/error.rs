//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Core error: {0}")]
    Core(#[from] xarb_core::CoreError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] xarb_ws::WsError),

    #[error("REST error: {0}")]
    Rest(#[from] xarb_rest::RestError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] xarb_telemetry::TelemetryError),

    #[error("Stream {stream} failed: {source}")]
    StreamFailed {
        stream: String,
        #[source]
        source: xarb_ws::WsError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for AppError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
