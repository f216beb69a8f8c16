//! # Error Handling
//!
//! Centralized error types for Corvid core.
//! Uses `thiserror` for ergonomic error definitions.
//!
//! Errors fall into four families:
//!
//! - **Configuration**: raised while the route table is being built
//!   (unknown middleware, duplicate route names, malformed patterns).
//! - **Not found**: no route matched; normally rendered as a 404 rather
//!   than propagated.
//! - **Data**: attribute casts and query construction problems.
//! - **Database**: driver failures, classified by [`DbErrorKind`] so callers
//!   can tell transient failures from logical ones.

use std::fmt;
use thiserror::Error;

/// Result type alias for Corvid operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of database failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Connection could not be established or was lost
    Connection,
    /// Pool acquisition or statement timed out
    Timeout,
    /// Unique, foreign key, not-null or check constraint violated
    Constraint,
    /// Any other statement failure (syntax, missing table, decode)
    Query,
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Constraint => write!(f, "constraint"),
            Self::Query => write!(f, "query"),
        }
    }
}

/// Core error types for the Corvid runtime
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

    /// Router failed to match the requested path
    #[error("No route found for {method} {path}")]
    RouteNotFound {
        /// The request method
        method: String,
        /// The path that wasn't matched
        path: String,
    },

    /// Invalid route pattern provided
    #[error("Invalid route pattern: {pattern}: {reason}")]
    InvalidRoutePattern {
        /// The invalid pattern
        pattern: String,
        /// Reason for invalidity
        reason: String,
    },

    /// A route name was registered twice
    #[error("Route name already registered: {name}")]
    DuplicateRouteName {
        /// The conflicting name
        name: String,
    },

    /// URL generation was missing a required placeholder value
    #[error("Missing required parameter '{parameter}' for route '{route}'")]
    MissingRouteParameter {
        /// Route name
        route: String,
        /// Placeholder without a value
        parameter: String,
    },

    /// Middleware reference not present in the registry
    #[error("Middleware not registered: {name}")]
    MiddlewareNotRegistered {
        /// The unresolved name
        name: String,
    },

    /// Handler reference not present in the registry
    #[error("Handler not registered: {name}")]
    HandlerNotRegistered {
        /// The unresolved name
        name: String,
    },

    /// Query builder was used in a way that cannot compile
    #[error("Invalid query: {reason}")]
    InvalidQuery {
        /// What went wrong
        reason: String,
    },

    /// Attribute value could not be converted to its declared cast
    #[error("Cannot cast column '{column}' to {cast}: {reason}")]
    Cast {
        /// Offending column
        column: String,
        /// Declared cast kind
        cast: String,
        /// Conversion failure detail
        reason: String,
    },

    /// Relation name is not declared on the model schema
    #[error("Relation '{relation}' is not defined on table '{table}'")]
    RelationNotDefined {
        /// Table of the parent model
        table: String,
        /// Requested relation
        relation: String,
    },

    /// Database error
    #[error("Database {kind} error: {message}")]
    Database {
        /// Failure classification
        kind: DbErrorKind,
        /// Error message from database
        message: String,
    },

    /// Request exceeded its deadline
    #[error("Request timed out after {millis} ms")]
    Timeout {
        /// Configured deadline
        millis: u128,
    },

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    Config {
        /// Error detail
        message: String,
    },

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

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
    /// Build a database error of the given kind
    pub fn database(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self::Database {
            kind,
            message: message.into(),
        }
    }

    /// Build a cast error
    pub fn cast(column: &str, cast: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self::Cast {
            column: column.to_string(),
            cast: cast.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: DbErrorKind::Connection | DbErrorKind::Timeout,
                ..
            } | Self::Timeout { .. }
        )
    }

    /// Whether this error was raised while building the route table
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidRoutePattern { .. }
                | Self::DuplicateRouteName { .. }
                | Self::MissingRouteParameter { .. }
                | Self::MiddlewareNotRegistered { .. }
                | Self::HandlerNotRegistered { .. }
                | Self::Config { .. }
        )
    }

    /// HTTP status used when this error reaches the error renderer
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::RouteNotFound { .. } => 404,
            Self::PayloadTooLarge { .. } => 413,
            Self::Cast { .. } | Self::Json(_) => 422,
            Self::Timeout { .. } => 504,
            Self::Database {
                kind: DbErrorKind::Connection | DbErrorKind::Timeout,
                ..
            } => 503,
            _ => 500,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let kind = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Configuration(_) => DbErrorKind::Connection,
            sqlx::Error::PoolTimedOut => DbErrorKind::Timeout,
            sqlx::Error::Database(db) => match db.kind() {
                sqlx::error::ErrorKind::UniqueViolation
                | sqlx::error::ErrorKind::ForeignKeyViolation
                | sqlx::error::ErrorKind::NotNullViolation
                | sqlx::error::ErrorKind::CheckViolation => DbErrorKind::Constraint,
                _ => DbErrorKind::Query,
            },
            _ => DbErrorKind::Query,
        };
        Self::Database {
            kind,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_not_found_error() {
        let err = Error::RouteNotFound {
            method: "GET".to_string(),
            path: "/unknown".to_string(),
        };
        assert!(err.to_string().contains("/unknown"));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_bind_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = Error::BindError {
            address: "0.0.0.0:8000".to_string(),
            source: io_err,
        };
        assert!(err.to_string().contains("0.0.0.0:8000"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::database(DbErrorKind::Connection, "reset").is_transient());
        assert!(Error::database(DbErrorKind::Timeout, "pool").is_transient());
        assert!(!Error::database(DbErrorKind::Constraint, "unique").is_transient());
        assert!(!Error::database(DbErrorKind::Query, "syntax").is_transient());
    }

    #[test]
    fn test_cast_error_names_column() {
        let err = Error::cast("settings", "json", "expected value");
        let text = err.to_string();
        assert!(text.contains("settings"));
        assert!(text.contains("json"));
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_pool_timeout_maps_to_timeout_kind() {
        let err: Error = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(
            err,
            Error::Database {
                kind: DbErrorKind::Timeout,
                ..
            }
        ));
        assert_eq!(err.status_code(), 503);
    }

    #[test]
    fn test_configuration_errors() {
        let err = Error::MiddlewareNotRegistered {
            name: "auth".to_string(),
        };
        assert!(err.is_configuration());
        assert!(!Error::Timeout { millis: 10 }.is_configuration());
    }
}
