//! Error types shared across the Lightbox crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the record model, schema and codecs.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A string that should be an `at://` URI is not one.
    #[error("invalid AT URI '{uri}': {reason}")]
    InvalidUri {
        /// The offending input.
        uri: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// An `indexed_at` value that is not RFC 3339.
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// A pagination cursor that is not non-negative epoch milliseconds.
    #[error("invalid cursor '{0}': expected non-negative integer milliseconds")]
    InvalidCursor(String),

    /// A `record_type` column value outside {post, repost}.
    #[error("unknown record type '{0}'")]
    UnknownRecordType(String),

    /// The database was written by a newer schema than this build understands.
    #[error("database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema {
        /// Version stored in the database.
        found: i32,
        /// Highest version this build can read.
        supported: i32,
    },
}
