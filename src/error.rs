//! Error types for the database operations layer.
//!
//! This module defines all error types using `thiserror`. Variants separate
//! failures the caller must see (write failures, backup failures, fatal
//! shutdown failures) from ones the router recovers from on its own.

use crate::models::BackupKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u32,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Unsupported on {backend}: {operation}")]
    Unsupported { operation: String, backend: String },

    #[error("Write query failed: {source}")]
    WriteFailed {
        #[source]
        source: Box<DbError>,
    },

    #[error("{kind} backup failed: {source}")]
    BackupFailed {
        kind: BackupKind,
        #[source]
        source: Box<DbError>,
    },

    #[error("Backup rotation failed: {source}")]
    RotationFailed {
        #[source]
        source: Box<DbError>,
    },

    #[error("Object storage error: {message}")]
    Storage { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("Maintenance failed: {message}")]
    Maintenance { message: String },

    #[error("Shutdown cleanup failed: {message}")]
    Shutdown { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an unsupported-operation error for a backend.
    pub fn unsupported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Wrap a primary-pool failure as a write failure.
    pub fn write_failed(source: DbError) -> Self {
        Self::WriteFailed {
            source: Box::new(source),
        }
    }

    /// Wrap the root cause of a failed backup run.
    pub fn backup_failed(kind: BackupKind, source: DbError) -> Self {
        Self::BackupFailed {
            kind,
            source: Box::new(source),
        }
    }

    /// Wrap the root cause of a failed rotation (listing) step.
    pub fn rotation_failed(source: DbError) -> Self {
        Self::RotationFailed {
            source: Box::new(source),
        }
    }

    /// Create an object storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a maintenance error.
    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::Maintenance {
            message: message.into(),
        }
    }

    /// Create a shutdown error.
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::WriteFailed { source } => source.is_retryable(),
            _ => false,
        }
    }

    /// Errors that must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Shutdown { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(db_err.message(), code)
            }
            sqlx::Error::RowNotFound => DbError::database("No rows returned", None),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 30),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::database(format!("Column not found: {}", col), None)
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

impl From<object_store::Error> for DbError {
    fn from(err: object_store::Error) -> Self {
        DbError::storage(err.to_string())
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::io(err.to_string())
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::connection("refused", "Check the server");
        assert_eq!(err.suggestion(), Some("Check the server"));
        assert_eq!(DbError::internal("x").suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::invalid_input("bad").is_retryable());
    }

    #[test]
    fn test_write_failed_wraps_cause() {
        let err = DbError::write_failed(DbError::database("relation does not exist", None));
        assert!(err.to_string().starts_with("Write query failed"));
        assert!(err.to_string().contains("relation does not exist"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_write_failed_retryable_follows_cause() {
        let err = DbError::write_failed(DbError::timeout("query execution", 30));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_backup_failed_names_kind() {
        let err = DbError::backup_failed(BackupKind::Full, DbError::io("disk full"));
        assert_eq!(err.to_string(), "full backup failed: I/O error: disk full");
    }

    #[test]
    fn test_only_shutdown_is_fatal() {
        assert!(DbError::shutdown("pool close").is_fatal());
        assert!(!DbError::maintenance("vacuum").is_fatal());
        assert!(!DbError::rotation_failed(DbError::storage("list")).is_fatal());
    }
}
