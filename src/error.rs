//! Error types for Outline Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutlineError {
    #[error("Core not initialized")]
    NotInitialized,

    #[error("Core already initialized")]
    AlreadyInitialized,

    #[error("Lock error")]
    LockError,

    #[error("Invalid access key: {0}")]
    InvalidDescriptor(String),

    #[error("Malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("Remote access key fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Failures of a [`RemoteFetcher`](crate::fetch::RemoteFetcher).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The server answered 429; callers may want to back off.
    #[error("Too many requests")]
    Throttled,

    #[error("Unexpected HTTP status {0}")]
    Status(u16),

    #[error("Invalid content type: {0}")]
    ContentType(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unreadable body: {0}")]
    Body(String),
}

impl From<base64::DecodeError> for OutlineError {
    fn from(err: base64::DecodeError) -> Self {
        OutlineError::MalformedEncoding(err.to_string())
    }
}

impl From<serde_json::Error> for OutlineError {
    fn from(err: serde_json::Error) -> Self {
        OutlineError::InvalidDescriptor(format!("malformed access key document: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, OutlineError>;
