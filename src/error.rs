//! Error types for IDX storage operations

use thiserror::Error;

/// Main error type for IDX operations
#[derive(Error, Debug)]
pub enum IdxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid IDX format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported IDX version: {0}")]
    UnsupportedVersion(u32),

    #[error("cannot open file {0}")]
    CannotOpen(String),

    #[error("block {blockid} not stored (offset={offset} size={size})")]
    NotStored { blockid: u64, offset: u64, size: u32 },

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("dtype mismatch: {0}")]
    DTypeMismatch(String),

    #[error("aborted")]
    Aborted,

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("no child dataset contributed to {0}")]
    NoContribution(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl IdxError {
    /// True when the failure is the caller's own cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, IdxError::Aborted)
    }

    /// Missing data: a region query treats these blocks as absent.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, IdxError::NotStored { .. } | IdxError::CannotOpen(_))
    }
}

/// Specialized Result type for IDX operations
pub type Result<T> = std::result::Result<T, IdxError>;

impl From<bincode::Error> for IdxError {
    fn from(err: bincode::Error) -> Self {
        IdxError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IdxError {
    fn from(err: serde_json::Error) -> Self {
        IdxError::Serialization(err.to_string())
    }
}
