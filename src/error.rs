//! Error types for Spindle
//!
//! A missing file is not an error: lookups report it as a value
//! (`Resolution::NotFound`, `FileLookup::NotFound`) and the shared cache
//! stores it like any other answer.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Spindle
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parent directory of a query is known not to exist
    #[error("Directory not found: {dir}")]
    DirectoryNotFound { dir: String },

    // =========================================================================
    // Transport / Protocol Errors
    // =========================================================================
    /// Sending to or receiving from the server failed
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Peer sent a message of an unexpected type or shape
    #[error("Protocol violation: expected {expected}, got {actual}")]
    ProtocolViolation { expected: String, actual: String },

    /// Server received the query but could not answer it
    #[error("Server error: {0}")]
    ServerError(String),

    /// Message could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// Shared heap could not free enough space even after evicting everything evictable
    #[error("Shared cache exhausted: could not allocate {requested} bytes (used {used} of {limit})")]
    CacheExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    /// Path exceeds the maximum supported length
    #[error("Path too long ({len} bytes, max {max}): {path}")]
    PathTooLong { path: String, len: usize, max: usize },

    /// Shared segment could not be created, mapped or validated
    #[error("Shared segment setup failed for {path}: {reason}")]
    ShmSetup { path: String, reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a protocol violation from the expected and received message kinds.
    pub fn protocol(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Error::ProtocolViolation {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for failures a client should answer by falling back to an uncached lookup.
    pub fn is_bypassable(&self) -> bool {
        matches!(
            self,
            Error::TransportFailure(_) | Error::CacheExhausted { .. }
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}
