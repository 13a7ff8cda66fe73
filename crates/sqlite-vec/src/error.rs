//! Error types for sqlite-vec

use std::path::PathBuf;

use thiserror::Error;

use crate::vector::ElementType;

/// Result type alias for sqlite-vec operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sqlite-vec operations
#[derive(Error, Debug)]
pub enum Error {
    /// A value could not be read as a vector
    #[error("Invalid vector: {0}")]
    InvalidVector(String),

    /// Vector dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Two vectors (or a vector and a column) disagree on element type
    #[error("Element type mismatch: expected {expected}, got {actual}")]
    ElementTypeMismatch {
        expected: ElementType,
        actual: ElementType,
    },

    /// A function or query argument was out of range or malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `CREATE VIRTUAL TABLE ... USING vec0(...)` arguments were rejected
    #[error("Invalid vec0 table definition: {0}")]
    InvalidTableDefinition(String),

    /// A NumPy array could not be decoded
    #[error("Invalid .npy data: {0}")]
    Npy(String),

    /// Reading from the filesystem failed
    #[error("Could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON parsing failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error raised inside a named SQL function or module
    #[error("{name}: {source}")]
    Context {
        name: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Prefix the message with the SQL function or module that raised it.
    /// Failures reported by SQLite itself keep their result code.
    pub fn context(self, name: &str) -> Error {
        match self {
            Error::Sqlite(err @ rusqlite::Error::SqliteFailure(..)) => Error::Sqlite(err),
            other => Error::Context {
                name: name.to_string(),
                source: Box::new(other),
            },
        }
    }
}

impl From<Error> for rusqlite::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Sqlite(inner) => inner,
            other => rusqlite::Error::UserFunctionError(Box::new(other)),
        }
    }
}
