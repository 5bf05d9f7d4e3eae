//! Error types for tiered-memory

use thiserror::Error;

/// Result type alias for tiered-memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tiered-memory
#[derive(Error, Debug)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// Companion files disagree with each other or with relational rows.
    #[error("Storage inconsistency: {0}")]
    Inconsistent(String),

    /// Network or API failure talking to a remote collaborator.
    #[error("Collaborator unavailable: {0}")]
    Collaborator(String),

    /// A collaborator answered, but not with what we asked for.
    #[error("Malformed collaborator response: {0}")]
    MalformedResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn embedding(msg: impl Into<String>) -> Self {
        Self::Embedding(msg.into())
    }

    pub fn vector_index(msg: impl Into<String>) -> Self {
        Self::VectorIndex(msg.into())
    }

    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether retrying the same call later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Collaborator(_) | Self::Embedding(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Collaborator(err.to_string())
        }
    }
}
