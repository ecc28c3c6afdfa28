//! Error types for the Pulseboard sync core.

use thiserror::Error;

/// Result type alias using the sync core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for sync core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored record could not be read or written
    #[error("Store error: {0}")]
    Store(String),

    /// A registered listener returned a failure during dispatch
    #[error("Listener error: {0}")]
    Listener(String),

    /// Remote synchronization failed
    #[error("Sync error: {0}")]
    Sync(String),

    /// The remote source is unreachable
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::Connectivity(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_store() {
        let err = Error::Store("key vanished".to_string());
        assert_eq!(err.to_string(), "Store error: key vanished");
    }

    #[test]
    fn test_error_display_listener() {
        let err = Error::Listener("callback refused event".to_string());
        assert_eq!(err.to_string(), "Listener error: callback refused event");
    }

    #[test]
    fn test_error_display_sync() {
        let err = Error::Sync("collection fetch failed".to_string());
        assert_eq!(err.to_string(), "Sync error: collection fetch failed");
    }

    #[test]
    fn test_error_display_connectivity() {
        let err = Error::Connectivity("offline".to_string());
        assert_eq!(err.to_string(), "Connectivity error: offline");
    }

    #[test]
    fn test_error_display_timeout() {
        let err = Error::Timeout("probe exceeded 5s".to_string());
        assert_eq!(err.to_string(), "Timeout: probe exceeded 5s");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number");
        assert!(json_err.is_err());

        let err: Error = json_err.unwrap_err().into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn test_result_type_ok() {
        fn get_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(get_result().unwrap(), 42);
    }
}
