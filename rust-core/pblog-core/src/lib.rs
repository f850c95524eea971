//! # pblog Core
//!
//! Core runtime library for the pblog web application.
//! Route dispatch, interceptor chains, and per-worker connection and
//! transaction context over a small SQL statement builder.
//!
//! ## Architecture
//!
//! Tokio owns the sockets; handlers run synchronously on a fixed pool of
//! worker threads, each holding its own [`ConnectionContext`]. The
//! [`Dispatcher`] builds its [`Registry`] lazily on the first request.
//!
//! ## Modules
//!
//! - `router` - Per-method route tables ordered by priority
//! - `route` - Route compilation (static, dynamic, prefix, regex)
//! - `interceptor` - Scoped interceptor chains
//! - `dispatcher` - Registry and lazy bootstrap
//! - `module` - Route and interceptor declarations
//! - `handler` - Exchange, replies and handler errors
//! - `request` - HTTP request wrapper with headers, query and form parsing
//! - `statement` - SQL statement builder
//! - `database` - Driver and connection traits, SQLx driver
//! - `context` - Connection and transaction scopes
//! - `worker` - Handler thread pool
//! - `server` - HTTP server built on Hyper
//! - `settings` - TOML settings
//! - `json` - JSON parsing with simd-json
//! - `error` - Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod context;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod json;
pub mod logging;
pub mod module;
pub mod request;
pub mod route;
pub mod router;
pub mod server;
pub mod settings;
pub mod statement;
pub mod static_files;
pub mod worker;

#[cfg(test)]
mod testing;

pub use context::{ConnectionContext, ConnectionScope, ContextState, TransactionScope};
pub use database::{next_id, Connection, DbValue, Driver, Row, SqlxDriver};
pub use dispatcher::{BootstrapConfig, Dispatcher, Registry};
pub use error::{Error, Result};
pub use handler::{Dispatch, Exchange, Extensions, Handler, HandlerError, HandlerResult, Reply};
pub use interceptor::{access_log, Interceptor, Next};
pub use json::{parse_json, rows_to_json, to_json};
pub use logging::init_tracing;
pub use module::{InterceptorDescriptor, Module, RouteDescriptor};
pub use request::Request;
pub use route::{Route, RouteKind};
pub use router::{Method, RouteTable};
pub use server::{Response, Server, ServerConfig};
pub use settings::Settings;
pub use statement::{Placeholder, Predicate, Select, Statement, StatementBuilder};
pub use static_files::static_files;
pub use worker::WorkerPool;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.1");
    }
}
