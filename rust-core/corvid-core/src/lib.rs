//! # Corvid Core
//!
//! Core library for the Corvid web framework.
//! Provides routing with middleware, an HTTP server, a fluent SQL query
//! builder and an active-record style model layer.
//!
//! ## Architecture
//!
//! A [`Router`] is built once at startup, then frozen inside a [`Server`] and
//! shared by every connection task. Data access goes through owned
//! [`QueryBuilder`] values executed on a [`DatabasePool`]; [`Model`]s wrap
//! the builder for row-level CRUD and declared relations.
//!
//! ## Modules
//!
//! - `server` - HTTP server built on Hyper
//! - `router` - Route table, groups, named routes and dispatch
//! - `route` - Route metadata and compiled path patterns
//! - `handler` - Route handlers and the handler registry
//! - `middleware` - Middleware contract, chain executor and built-ins
//! - `request` / `response` - HTTP carriers
//! - `errors_page` - Not-found and error page rendering
//! - `query` - Fluent SQL query builder with named bindings
//! - `relation` - `HasOne`, `HasMany` and `BelongsTo` relations
//! - `model` - Schemas, casts and model CRUD
//! - `database` - SQLx connectivity (SQLite, PostgreSQL)
//! - `config` - TOML configuration with environment overrides
//! - `telemetry` - Tracing subscriber setup
//! - `json` - High-performance JSON parsing with simd-json
//! - `types` - Path parameter types and conversion
//! - `error` - Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod database;
pub mod error;
pub mod errors_page;
pub mod handler;
pub mod json;
pub mod middleware;
pub mod model;
pub mod query;
pub mod relation;
pub mod request;
pub mod response;
pub mod route;
pub mod router;
pub mod server;
pub mod telemetry;
pub mod types;

pub use config::{AppConfig, AuthConfig, DatabaseConfig, LogConfig, ServerConfig, ViewsConfig};
pub use database::{Bindings, DatabasePool, DbRow, DbValue};
pub use error::{DbErrorKind, Error, Result};
pub use errors_page::{ErrorPages, ErrorRenderer};
pub use handler::{handler, Handler, HandlerRef, HandlerRegistry};
pub use json::{parse_json, to_json};
pub use middleware::{
    AuthMiddleware, CorsMiddleware, CsrfMiddleware, JwtMiddleware, LoggingMiddleware, Middleware,
    MiddlewareChain, MiddlewareRegistry, RateLimitMiddleware,
};
pub use model::{Cast, Model, ModelQuery, Schema};
pub use query::{Boolean, Paginator, QueryBuilder, WhereClause};
pub use relation::{Loaded, Relation, RelationKind, RelationSpec};
pub use request::{ParsedBody, Request, UploadedFile};
pub use response::{Cookie, Response};
pub use route::Route;
pub use router::{GroupConfig, Method, MiddlewareOrder, RouteHandle, RouteMatch, Router};
pub use server::Server;
pub use telemetry::init_tracing;
pub use types::{ParamType, ParamValue, Params};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
