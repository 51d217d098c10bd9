//! Error handling for the call billing worker
//!
//! Centralized error type shared by the queue, store, outbound call and pool
//! layers. Nothing past startup escalates these errors: workers log them and
//! move on, so the variants mostly exist to give logs a precise category.

use thiserror::Error;

/// Error type covering every fallible operation inside the worker core
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Queue transport errors (receive, delete, send)
    #[error("Queue error: {0}")]
    Queue(String),

    /// External service errors
    #[error("External service error: {0}")]
    ExternalService(String),

    /// Payload decoding errors
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Internal errors, including panics captured at an iteration boundary
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenient result type for all worker operations
pub type AppResult<T> = Result<T, AppError>;

/// Converts HTTP client errors to application errors
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalService(format!("HTTP request error: {}", err))
    }
}

/// Convenient macro for creating queue errors
#[macro_export]
macro_rules! queue_error {
    ($msg:expr) => {
        $crate::error::AppError::Queue($msg.to_string())
    };
}

/// Convenient macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::AppError::Internal($msg.to_string())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::Queue("receive failed".to_string());
        assert_eq!(err.to_string(), "Queue error: receive failed");

        let err = internal_error!("worker panicked");
        assert_eq!(err.to_string(), "Internal error: worker panicked");
    }

    #[test]
    fn test_from_serde_error() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: AppError = parse_err.into();
        assert!(matches!(err, AppError::Decode(_)));
    }
}
