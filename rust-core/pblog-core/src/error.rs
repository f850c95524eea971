//! # Error Handling
//!
//! Centralized error types for pblog core.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Registration errors (`RouteConflict`, `InterceptorConflict`, ...) are meant
//! to abort startup. Data-access errors always carry the driver message.

use crate::router::Method;
use thiserror::Error;

/// Result type alias for pblog operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the pblog runtime
#[derive(Error, Debug)]
pub enum Error {
    /// Server failed to bind to the specified address
    #[error("Failed to bind server to {address}: {source}")]
    BindError {
        /// The address we tried to bind to
        address: String,
        /// The underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A route with the same normalized pattern already exists for the method
    #[error("Route conflict: {method} {pattern} is already registered")]
    RouteConflict {
        /// HTTP method of the conflicting route
        method: Method,
        /// Pattern of the route being registered
        pattern: String,
    },

    /// An interceptor with the same name was already registered
    #[error("Interceptor conflict: '{name}' is already registered")]
    InterceptorConflict {
        /// Interceptor name
        name: String,
    },

    /// Invalid route pattern provided
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Interceptor pattern is not of the form `*?literal*?`
    #[error("Invalid interceptor pattern: '{pattern}'")]
    InvalidInterceptorPattern {
        /// The invalid pattern
        pattern: String,
    },

    /// A module listed in `module_scan` was never declared
    #[error("Module '{name}' is listed in module_scan but was not declared")]
    UnknownModule {
        /// Module name from settings
        name: String,
    },

    /// Bootstrap failed earlier; the dispatcher cannot serve requests
    #[error("Dispatcher bootstrap failed: {message}")]
    Bootstrap {
        /// Message of the original failure
        message: String,
    },

    /// Internal dispatch found no route
    #[error("No route found for {method} {path}")]
    RouteNotFound {
        /// Requested method
        method: Method,
        /// The path that wasn't matched
        path: String,
    },

    /// Malformed statement input, detected before execution
    #[error("Statement error: {reason}")]
    Statement {
        /// What was wrong with the clause input
        reason: String,
    },

    /// Database error
    #[error("Database error: {message}")]
    Database {
        /// Error message from database
        message: String,
    },

    /// Commit or rollback failed
    #[error("Transaction failed: {message}")]
    Transaction {
        /// Error message from the failing commit/rollback
        message: String,
    },

    /// A scalar select returned a row with more or fewer than one column
    #[error("Expected exactly one column, got {count}")]
    MultiColumns {
        /// Number of columns in the row
        count: usize,
    },

    /// Settings could not be loaded or are invalid
    #[error("Settings error: {message}")]
    Settings {
        /// What went wrong
        message: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Request body is not valid JSON
    #[error("Invalid JSON body: {reason}")]
    InvalidJson {
        /// Parser message
        reason: String,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request payload too large
    #[error("Payload too large: limit={limit} bytes, received={actual} bytes")]
    PayloadTooLarge {
        /// Max allowed size
        limit: usize,
        /// Actual size
        actual: usize,
    },
}

impl Error {
    pub(crate) fn statement(reason: impl Into<String>) -> Self {
        Self::Statement {
            reason: reason.into(),
        }
    }

    pub(crate) fn database(message: impl std::fmt::Display) -> Self {
        Self::Database {
            message: message.to_string(),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_conflict_error() {
        let err = Error::RouteConflict {
            method: Method::Get,
            pattern: "/about".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Route conflict: GET /about is already registered"
        );
    }

    #[test]
    fn test_bind_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Error::BindError {
            address: "0.0.0.0:5100".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("0.0.0.0:5100"));
    }

    #[test]
    fn test_statement_error_message() {
        let err = Error::statement("table name is empty");
        assert!(err.to_string().contains("table name is empty"));
    }
}
