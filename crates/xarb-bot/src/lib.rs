//! xarb composition root.
//!
//! Wires the configured streams and the shared REST client together:
//! - One `ConnectionManager` per configured stream
//! - Listen-key provider for private streams, backed by REST
//! - Graceful shutdown on ctrl-c or the first fatal stream error

pub mod app;
pub mod config;
pub mod error;
pub mod listen_key;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use listen_key::ListenKeyProvider;
