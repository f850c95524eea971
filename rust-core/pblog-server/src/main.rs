//! # pblog Server
//!
//! Loads `setting.toml` (or `$PBLOG_SETTINGS`), installs logging, opens the
//! database driver and serves the built-in modules:
//!
//! - `pblog.api` - `/api/version` and the `/api/` composition endpoint
//! - `pblog.static` - files under `[server] static_root` at `/static/*`

use anyhow::Context;
use pblog_core::{
    access_log, init_tracing, ConnectionContext, Dispatcher, Exchange, HandlerError,
    HandlerResult, Method, Module, Reply, RouteDescriptor, Server, ServerConfig, Settings,
    SqlxDriver, StatementBuilder,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("failed to load settings")?;
    init_tracing(&settings.log);
    info!(version = pblog_core::VERSION, "starting pblog");

    let driver = Arc::new(SqlxDriver::new(settings.database.url.clone())?);
    let placeholder = settings.database.placeholder;

    let static_root = settings.server.static_root.clone();
    let dispatcher = Arc::new(
        Dispatcher::new(settings.bootstrap())
            .module("pblog.api", api_module)
            .module("pblog.static", move || {
                Module::new().route(RouteDescriptor::new(
                    Method::Get,
                    "/static/*",
                    pblog_core::static_files(static_root),
                ))
            }),
    );

    let config = ServerConfig::from_settings(&settings)?;
    let server = Server::new(config, dispatcher, move || {
        let ctx = ConnectionContext::new(driver.clone());
        match placeholder {
            Some(style) => ctx.with_builder(StatementBuilder::new(style)),
            None => ctx,
        }
    })?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(server.serve())?;
    info!("pblog stopped");
    Ok(())
}

fn api_module() -> Module {
    Module::new()
        .interceptor(access_log("/api/"))
        .get("/api/version", |_, _| {
            Ok(Reply::Json(serde_json::json!({ "version": pblog_core::VERSION })))
        })
        .get("/api/", compose)
}

/// `GET /api/?users=/api/users&blogs=/api/blogs`: one object holding each
/// named API result
fn compose(exchange: &mut Exchange<'_>, _: &[String]) -> HandlerResult {
    let request = exchange.request();
    let mut parts: Vec<(&String, &String)> = request.query_map().iter().collect();
    parts.sort();

    let mut result = Map::new();
    for (name, target) in parts {
        let path = target.split_once('?').map_or(target.as_str(), |(path, _)| path);
        if !path.starts_with("/api/") || path.trim_end_matches('/') == "/api" {
            return Err(HandlerError::bad_request(format!("invalid api path: {target}")));
        }
        let value = match exchange.internal_dispatch(Method::Get, path)? {
            Reply::Json(value) => value,
            Reply::Text(text) | Reply::Html(text) => Value::String(text),
            Reply::NoContent => Value::Null,
            Reply::Bytes { .. } => {
                return Err(HandlerError::bad_request(format!("not a json api: {path}")))
            }
        };
        result.insert(name.clone(), value);
    }
    Ok(Reply::Json(Value::Object(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pblog_core::{BootstrapConfig, Dispatch, Request};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(BootstrapConfig::default())
            .module("pblog.api", api_module)
            .module("blogs", || {
                Module::new().get("/api/blogs", |_, _| {
                    Ok(Reply::Json(serde_json::json!([{ "id": 1 }])))
                })
            })
    }

    fn compose_request(query: &str) -> Result<Dispatch, HandlerError> {
        let driver = Arc::new(SqlxDriver::new("sqlite::memory:").unwrap());
        let mut ctx = ConnectionContext::new(driver);
        dispatcher().handle(&Request::get(format!("/api/?{query}")), &mut ctx)
    }

    #[test]
    fn test_compose_strips_sub_query() {
        let result = compose_request("blogs=/api/blogs%3Fpage%3D2&version=/api/version").unwrap();
        let value = match result {
            Dispatch::Handled(Reply::Json(value)) => value,
            other => panic!("expected a json reply, got {other:?}"),
        };
        assert_eq!(value["blogs"], serde_json::json!([{ "id": 1 }]));
        assert_eq!(value["version"]["version"], pblog_core::VERSION);
    }

    #[test]
    fn test_compose_rejects_non_api_paths() {
        let err = compose_request("me=/api/?x=1").unwrap_err();
        assert_eq!(err.status(), 400);
        let err = compose_request("page=/manage/").unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
