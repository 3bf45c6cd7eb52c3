//! Error types for encore-player
//!
//! Module-specific error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for the player
#[derive(Error, Debug)]
pub enum Error {
    /// Shared error from encore-common
    #[error(transparent)]
    Common(#[from] encore_common::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP/WebSocket server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Audio backend control errors
    #[error("Audio backend error: {0}")]
    Backend(String),

    /// Reattachment to a detached backend session failed
    #[error("Reattach failed: {0}")]
    Reattach(String),

    /// Session persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using the player Error
pub type Result<T> = std::result::Result<T, Error>;
