//! Error types for cacheport.
//!
//! These errors never cross the public `CacheBackend` contract: storage
//! primitives return them, and the shared default methods turn them into
//! `false` / absent results after logging.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cache storage primitives.
#[derive(Debug, Error)]
pub enum CacheError {
    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Database errors
    #[cfg(feature = "sqlite")]
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Daemon errors
    #[error("Connection to {endpoint} failed: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Backend is not connected")]
    NotConnected,

    #[error("Backend {backend} is not available in this build")]
    Unsupported { backend: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        CacheError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CacheError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CacheError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether the store behind the backend could not be reached at all.
    ///
    /// Hosts may use this to decide between "recompute" and "disable cache".
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            CacheError::Connection { .. } | CacheError::NotConnected | CacheError::Unsupported { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::Connection {
            endpoint: "127.0.0.1:11211".into(),
            message: "refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Connection to 127.0.0.1:11211 failed: refused"
        );
    }

    #[test]
    fn test_io_with_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = CacheError::io_with_path(io, "/cache/.cache-anchor");
        match err {
            CacheError::Io { path, .. } => {
                assert_eq!(path, Some(PathBuf::from("/cache/.cache-anchor")))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unavailable_errors() {
        assert!(CacheError::NotConnected.is_unavailable());
        assert!(CacheError::Unsupported {
            backend: "memcached".into()
        }
        .is_unavailable());
        assert!(!CacheError::Other("boom".into()).is_unavailable());
    }
}
