//! Error taxonomy for the shipping pipeline.
//!
//! - [`ConfigError`]: invalid setup, raised at construction.
//! - [`TransportError`]: a named sink failed to write, flush or close. Wraps
//!   either a backend failure ([`ClientError`]), a shutdown or write timeout,
//!   a closed sink or an I/O error.
//! - [`LoggerError`]: what the logging frontend returns from construction,
//!   `flush` and `close`.

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("config error [{field}]: {message}")]
pub struct ConfigError {
    /// The offending field or environment variable
    pub field: String,
    pub message: String,
}

impl ConfigError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The sink operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Write,
    Flush,
    Close,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Write => write!(f, "write"),
            Operation::Flush => write!(f, "flush"),
            Operation::Close => write!(f, "close"),
        }
    }
}

/// Why a sink operation failed.
#[derive(Debug, Error)]
pub enum Cause {
    #[error(transparent)]
    Backend(#[from] ClientError),

    #[error("timed out after {0:?} waiting for the background flusher to stop")]
    ShutdownTimeout(Duration),

    #[error("write did not finish within {0:?}")]
    WriteTimeout(Duration),

    #[error("sink is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A named sink failed an operation.
#[derive(Debug, Error)]
#[error("transport '{transport}' operation '{op}' failed: {cause}")]
pub struct TransportError {
    pub transport: String,
    pub op: Operation,
    #[source]
    pub cause: Cause,
}

impl TransportError {
    pub fn new(transport: impl Into<String>, op: Operation, cause: impl Into<Cause>) -> Self {
        Self {
            transport: transport.into(),
            op,
            cause: cause.into(),
        }
    }

    /// Whether this is a graceful-shutdown timeout rather than a delivery
    /// failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, Cause::ShutdownTimeout(_))
    }
}

/// Errors surfaced by the logging frontend.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::new("batch_size", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "config error [batch_size]: must be greater than 0"
        );
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::new(
            "loki",
            Operation::Close,
            Cause::ShutdownTimeout(Duration::from_secs(2)),
        );
        let text = err.to_string();
        assert!(text.contains("'loki'"));
        assert!(text.contains("'close'"));
        assert!(text.contains("2s"));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_backend_error_is_not_timeout() {
        let err = TransportError::new("loki", Operation::Flush, ClientError::Cancelled);
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("cancelled"));
    }

    #[test]
    fn test_write_timeout_is_not_shutdown_timeout() {
        let err = TransportError::new(
            "console",
            Operation::Write,
            Cause::WriteTimeout(Duration::from_millis(50)),
        );
        assert!(!err.is_timeout());
        assert!(err.to_string().contains("50ms"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = TransportError::new("console", Operation::Write, io);
        assert!(matches!(err.cause, Cause::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}
