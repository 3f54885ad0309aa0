//! Error types for the companion memory system.

use thiserror::Error;

/// Errors that can occur in the companion memory system.
///
/// Recoverable conditions (missing embedding backend, index schema mismatch,
/// rejected keyword query syntax) are absorbed where they are detected and
/// never show up here.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Database-related errors (SQLite).
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem errors while reading or persisting artifacts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Side table (JSON) could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Vector index artifact could not be encoded or decoded.
    #[error("Index encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Configuration could not be parsed or holds invalid values.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input provided by the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The vector append of a commit failed; the episodic row was rolled back.
    #[error("Vector index write failed for fragment {id}, episodic row removed: {reason}")]
    IndexWrite { id: i64, reason: String },

    /// The vector append failed and the episodic row could not be removed either.
    /// The fragment is keyword-searchable but not indexed until the next rebuild.
    #[error("Index write failed for fragment {id} ({reason}), rollback failed: {rollback}")]
    CompensationFailed {
        id: i64,
        reason: String,
        rollback: String,
    },
}

impl From<toml::de::Error> for MemoryError {
    fn from(e: toml::de::Error) -> Self {
        MemoryError::Config(e.to_string())
    }
}
