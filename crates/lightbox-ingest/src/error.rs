//! Error types for the ingestion pipeline.

use thiserror::Error;

use crate::xrpc::XrpcError;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the shared record model or schema.
    #[error(transparent)]
    Core(#[from] lightbox_core::Error),

    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream XRPC call failed.
    #[error(transparent)]
    Xrpc(#[from] XrpcError),

    /// A directory page stayed rate limited after every retry.
    #[error("rate limited by {method} after {attempts} attempts")]
    RateLimited {
        /// XRPC method that kept returning 429.
        method: &'static str,
        /// Attempts made, including the first.
        attempts: u32,
    },

    /// Stored cursor state cannot be trusted.
    #[error("corrupt cursor for service '{service}': {value}")]
    CorruptCursor {
        /// Subscription source name.
        service: String,
        /// The stored value, rendered for diagnostics.
        value: String,
    },

    /// Websocket or stream protocol error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
