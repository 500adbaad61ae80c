//! Error types for the lease broker.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Lease lookups, session bindings and transaction state each fail with their own
//! variant so callers can decide whether to re-initialize or give up.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Error initializing database: {message}")]
    Init { message: String },

    #[error("Connection is not yet initialized for '{target}'")]
    NotInitialized { target: String },

    #[error("Connection key not found: {lease_key}")]
    LeaseNotFound { lease_key: String },

    #[error("Transaction error: {message} (lease: {lease_key})")]
    TransactionState { message: String, lease_key: String },

    #[error("Failed to terminate database connection pool: {message}")]
    Termination { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation}{}", limit_suffix(.limit_secs))]
    Timeout {
        operation: String,
        /// Configured limit, when the caller knows it
        limit_secs: Option<u64>,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an initialization error.
    pub fn init(message: impl Into<String>) -> Self {
        Self::Init {
            message: message.into(),
        }
    }

    /// Create a not-initialized error for a database target.
    pub fn not_initialized(target: impl Into<String>) -> Self {
        Self::NotInitialized {
            target: target.into(),
        }
    }

    /// Create a lease not found error.
    pub fn lease_not_found(lease_key: impl ToString) -> Self {
        Self::LeaseNotFound {
            lease_key: lease_key.to_string(),
        }
    }

    /// Create a transaction state error.
    pub fn transaction_state(message: impl Into<String>, lease_key: impl ToString) -> Self {
        Self::TransactionState {
            message: message.into(),
            lease_key: lease_key.to_string(),
        }
    }

    /// Create a pool termination error.
    pub fn termination(message: impl Into<String>) -> Self {
        Self::Termination {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error for an operation with a known limit.
    pub fn timeout(operation: impl Into<String>, limit_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit_secs: Some(limit_secs),
        }
    }

    /// Create a timeout error when the limit is not known here.
    pub fn timed_out(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            limit_secs: None,
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

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::NotInitialized { .. } => Some("Call connect before querying"),
            Self::LeaseNotFound { .. } => {
                Some("The lease was released or expired; initialize a new connection")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Init { .. } => "DATABASE_INIT_ERROR",
            Self::NotInitialized { .. } => "CONNECTION_NOT_INITIALIZED",
            Self::LeaseNotFound { .. } => "CONNECTION_NOT_FOUND",
            Self::TransactionState { .. } => "TRANSACTION_STATE_ERROR",
            Self::Termination { .. } => "DATABASE_TERMINATION_ERROR",
            Self::Connection { .. } => "CONNECTION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotInitialized { .. } | Self::TransactionState { .. } => StatusCode::CONFLICT,
            Self::LeaseNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidInput { .. } | Self::Database { .. } => StatusCode::BAD_REQUEST,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn limit_suffix(limit_secs: &Option<u64>) -> String {
    limit_secs
        .map(|secs| format!(" exceeded {}s", secs))
        .unwrap_or_else(|| " timed out".to_string())
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
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timed_out("connection pool acquire"),
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
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// JSON body for error responses.
#[derive(Debug, serde::Serialize)]
struct ErrorBody {
    status: u16,
    code: &'static str,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            status: status.as_u16(),
            code: self.code(),
            error: self.to_string(),
            suggestion: self.suggestion().map(String::from),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::lease_not_found("orders:42");
        assert_eq!(err.to_string(), "Connection key not found: orders:42");

        let err = DbError::not_initialized("orders");
        assert!(err.to_string().contains("not yet initialized"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "Syntax error",
            Some("42601".to_string()),
            "Check SQL syntax",
        );
        assert_eq!(err.suggestion(), Some("Check SQL syntax"));
        assert!(DbError::termination("closed").suggestion().is_none());
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::lease_not_found("k").is_retryable());
        assert!(!DbError::not_initialized("t").is_retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DbError::not_initialized("t").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DbError::lease_not_found("k").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DbError::transaction_state("nested", "k").status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DbError::invalid_input("bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DbError::init("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DbError::termination("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(DbError::init("x").code(), "DATABASE_INIT_ERROR");
        assert_eq!(DbError::lease_not_found("x").code(), "CONNECTION_NOT_FOUND");
        assert_eq!(
            DbError::transaction_state("x", "k").code(),
            "TRANSACTION_STATE_ERROR"
        );
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(
            DbError::timeout("connection pool acquire", 5).to_string(),
            "Timeout: connection pool acquire exceeded 5s"
        );
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert_eq!(err.to_string(), "Timeout: connection pool acquire timed out");
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_pool_closed_maps_to_connection_error() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_into_response_status() {
        let response = DbError::lease_not_found("orders:7").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
