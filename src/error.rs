//! Unified error handling for crowd-replay.
//!
//! Every fallible operation in the crate returns [`PlaybackError`]. The
//! variants follow the loader's failure taxonomy: a missing file, an invalid
//! schema, a degenerate walkable area and a crashed background worker are
//! reported differently to the host.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for playback operations.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// The trajectory file does not exist.
    #[error("File not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// A required table or column is missing from the store.
    #[error("Invalid trajectory schema: missing {identifier}")]
    SchemaInvalid { identifier: String },

    /// The walkable-area union is empty, degenerate, or not a single polygon.
    #[error("Invalid walkable area: {message}")]
    GeometryInvalid { message: String },

    /// The background metadata worker panicked.
    #[error("Worker failure: {message}")]
    WorkerFailure { message: String, trace: String },

    /// A load was requested while another one is still running.
    #[error("A load is already in progress")]
    LoadInProgress,

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// SQLite error not attributable to the schema
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PlaybackError {
    /// Re-classify a SQLite failure caused by a missing table or column.
    ///
    /// Schema problems only surface when a query runs, so query helpers pass
    /// their errors through here to report the missing identifier instead of
    /// a raw SQLite message.
    pub fn from_query(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
            for prefix in ["no such table: ", "no such column: "] {
                if let Some(identifier) = message.strip_prefix(prefix) {
                    return PlaybackError::SchemaInvalid {
                        identifier: identifier.to_string(),
                    };
                }
            }
        }
        PlaybackError::Sqlite(err)
    }

    /// Whether retrying with the same input can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlaybackError::LoadInProgress | PlaybackError::WorkerFailure { .. }
        )
    }
}

/// Result type alias for playback operations.
pub type Result<T> = std::result::Result<T, PlaybackError>;

/// Extension trait for converting Option to PlaybackError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a missing schema identifier error.
    fn ok_or_schema(self, identifier: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_schema(self, identifier: &str) -> Result<T> {
        self.ok_or_else(|| PlaybackError::SchemaInvalid {
            identifier: identifier.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| PlaybackError::Internal {
            message: message.to_string(),
        })
    }
}
