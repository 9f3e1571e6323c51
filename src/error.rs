//! Error types for jobspawn.

use thiserror::Error;

/// Main error type for jobspawn.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Orchestrator loop failed: {0}")]
    Orchestrator(String),
}

/// Result type alias for jobspawn operations.
pub type Result<T> = std::result::Result<T, SpawnError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_worker_error_message() {
        let err = SpawnError::Worker("pipe closed".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Worker error"));
        assert!(msg.contains("pipe closed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe");
        let err: SpawnError = io_err.into();
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ nope }").unwrap_err();
        let err: SpawnError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_config_error_message() {
        let err = SpawnError::Config("max-in-flight must be at least 1".to_string());
        assert!(err.to_string().contains("max-in-flight"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(7)
        }
        assert_eq!(returns_ok().unwrap(), 7);
    }
}
