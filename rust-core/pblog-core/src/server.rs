//! # HTTP Server
//!
//! HTTP transport built on Hyper and Tokio.
//! Implements graceful shutdown with signal handling.
//!
//! ## Key Features
//!
//! - Async socket I/O on the Tokio runtime, handlers on the worker pool
//! - Graceful shutdown on Ctrl-C with a bounded drain
//! - Maps handler outcomes to status codes (404, 30x, 500)

use crate::context::ConnectionContext;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::handler::{Dispatch, HandlerError};
use crate::request::Request;
use crate::settings::Settings;
use crate::worker::WorkerPool;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// HTTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub address: SocketAddr,
    /// Shutdown timeout for graceful shutdown (default: 30 seconds)
    pub shutdown_timeout: Duration,
    /// Max request body size in bytes
    pub max_body_size: usize,
    /// Worker threads
    pub workers: usize,
    /// Show error details in 500 responses
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: ([0, 0, 0, 0], 5100).into(),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
            workers: 4,
            debug: false,
        }
    }
}

impl ServerConfig {
    /// Server part of the settings
    ///
    /// # Errors
    ///
    /// Returns `Error::Settings` for an invalid address.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            address: settings.address()?,
            shutdown_timeout: settings.shutdown_timeout(),
            max_body_size: settings.server.max_body_size,
            workers: settings.workers(),
            debug: settings.debug,
        })
    }
}

/// Rendered HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl Response {
    /// Text response with a status
    pub fn plain(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![(
                "Content-Type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.into().into_bytes(),
        }
    }

    /// Set or override a header
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.headers.push((key.to_string(), value.to_string()));
        self
    }

    /// Header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Translate a dispatch outcome
    ///
    /// Handler failures other than redirects and explicit statuses are
    /// logged; their message reaches the client only in debug mode.
    pub fn from_dispatch(result: std::result::Result<Dispatch, HandlerError>, debug: bool) -> Self {
        match result {
            Ok(Dispatch::Handled(reply)) => {
                let status = reply.status();
                let content_type = reply.content_type().to_string();
                match reply.into_body() {
                    Ok(body) => Self {
                        status,
                        headers: vec![("Content-Type".to_string(), content_type)],
                        body,
                    },
                    Err(e) => Self::from_dispatch(Err(e.into()), debug),
                }
            }
            Ok(Dispatch::NotFound) => Self::plain(404, "Not Found"),
            Err(HandlerError::Redirect { status, location }) => {
                Self::plain(status, "").with_header("Location", &location)
            }
            Err(HandlerError::Http { status, message }) => Self::plain(status, message),
            Err(e) => {
                let status = e.status();
                if status >= 500 {
                    error!(error = %e, "handler failed");
                }
                let body = if debug || status < 500 {
                    e.to_string()
                } else {
                    canonical_reason(status).to_string()
                };
                Self::plain(status, body)
            }
        }
    }

    fn into_hyper(self) -> hyper::Response<Full<Bytes>> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = hyper::Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = status;
        let headers = response.headers_mut();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                hyper::header::HeaderName::from_bytes(k.as_bytes()),
                hyper::header::HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }
        response
    }
}

fn canonical_reason(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Internal Server Error")
}

/// HTTP server feeding the worker pool
pub struct Server {
    config: ServerConfig,
    pool: Arc<WorkerPool>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Start the worker pool; `make_context` builds each worker's context
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the worker threads cannot be spawned.
    pub fn new<F>(config: ServerConfig, dispatcher: Arc<Dispatcher>, make_context: F) -> Result<Self>
    where
        F: Fn() -> ConnectionContext,
    {
        let pool = WorkerPool::new(config.workers, dispatcher, config.debug, make_context)?;
        Ok(Self {
            config,
            pool: Arc::new(pool),
        })
    }

    /// Accept connections until Ctrl-C, then drain and stop the workers
    ///
    /// # Errors
    ///
    /// Returns `Error::BindError` if the address is unavailable.
    pub async fn serve(&self) -> Result<()> {
        let addr = self.config.address;
        let bind_err = |source| Error::BindError {
            address: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()
        } else {
            tokio::net::TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(1024).map_err(bind_err)?;

        info!("Server listening on http://{}", addr);

        let active = Arc::new(AtomicUsize::new(0));
        let max_body_size = self.config.max_body_size;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = match accept_result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let io = TokioIo::new(stream);
                    let pool = Arc::clone(&self.pool);
                    let active = Arc::clone(&active);

                    tokio::task::spawn(async move {
                        active.fetch_add(1, Ordering::Relaxed);
                        let service = service_fn(move |req| {
                            let pool = Arc::clone(&pool);
                            async move {
                                Ok::<_, hyper::Error>(
                                    handle_request(req, &pool, remote_addr, max_body_size).await,
                                )
                            }
                        });
                        if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                            error!("Error serving connection: {:?}", err);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = shutdown_signal() => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout, drain).await.is_err() {
            warn!("shutdown timeout elapsed with connections still open");
        }

        let pool = Arc::clone(&self.pool);
        if tokio::task::spawn_blocking(move || pool.shutdown()).await.is_err() {
            error!("worker pool shutdown panicked");
        }
        Ok(())
    }

    /// Run a request through the worker pool without the network stack
    pub async fn test_request(&self, request: Request) -> Response {
        self.pool.submit(request).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
}

/// Incoming `X-Request-Id`, or a fresh UUID
fn request_id(request: &Request) -> String {
    request
        .header("x-request-id")
        .filter(|id| !id.is_empty() && id.len() <= 128)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string)
}

async fn handle_request(
    req: hyper::Request<hyper::body::Incoming>,
    pool: &WorkerPool,
    remote_addr: SocketAddr,
    max_body_size: usize,
) -> hyper::Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let version = req.version();

    let response = match Request::from_hyper_with_limit(req, max_body_size).await {
        Ok(mut request) => {
            let request_id = request_id(&request);
            request.set_header("x-request-id", &request_id);
            request.set_header("x-client-ip", &remote_addr.ip().to_string());
            pool.submit(request)
                .await
                .with_header("X-Request-Id", &request_id)
        }
        Err(Error::PayloadTooLarge { .. }) => Response::plain(413, "Payload Too Large"),
        Err(e) => {
            error!("Failed to parse request: {}", e);
            Response::plain(400, "Bad Request")
        }
    };

    info!(
        "    {} - \"{} {} {:?}\" {}",
        remote_addr, method, path, version, response.status
    );
    response.into_hyper()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::BootstrapConfig;
    use crate::handler::Reply;
    use crate::module::{Module, RouteDescriptor};
    use crate::router::Method;
    use crate::static_files::static_files;
    use crate::testing::RecordingDriver;

    fn server(debug: bool) -> Server {
        let static_root = std::env::temp_dir().join(format!("pblog-static-{}", std::process::id()));
        std::fs::create_dir_all(&static_root).unwrap();
        std::fs::write(static_root.join("site.css"), "body{}").unwrap();
        std::fs::write(static_root.join("print me.css"), "p{}").unwrap();

        let dispatcher = Arc::new(Dispatcher::new(BootstrapConfig::default()).module(
            "test",
            move || {
                Module::new()
                    .get("/api/version", |_, _| {
                        Ok(Reply::Json(serde_json::json!({ "version": "1.0" })))
                    })
                    .get("/manage/", |_, _| Err(HandlerError::see_other("/signin")))
                    .get("/fail", |_, _| Err(anyhow::anyhow!("disk on fire").into()))
                    .route(RouteDescriptor::new(
                        Method::Get,
                        "/static/*",
                        static_files(static_root),
                    ))
            },
        ));
        let config = ServerConfig {
            workers: 1,
            debug,
            ..ServerConfig::default()
        };
        Server::new(config, dispatcher, || {
            ConnectionContext::new(Arc::new(RecordingDriver::new()))
        })
        .unwrap()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.address.port(), 5100);
        assert_eq!(config.max_body_size, 1024 * 1024);
    }

    #[test]
    fn test_request_id_reused_or_generated() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("x-request-id".to_string(), "abc-123".to_string());
        let tagged = Request::new(Method::Get, "/", headers, None);
        assert_eq!(request_id(&tagged), "abc-123");

        let fresh = request_id(&Request::get("/"));
        assert!(uuid::Uuid::parse_str(&fresh).is_ok());
    }

    #[test]
    fn test_response_mapping() {
        let ok = Response::from_dispatch(Ok(Dispatch::Handled(Reply::text("hi"))), false);
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body, b"hi");

        let missing = Response::from_dispatch(Ok(Dispatch::NotFound), false);
        assert_eq!(missing.status, 404);

        let redirect = Response::from_dispatch(Err(HandlerError::found("/signin")), false);
        assert_eq!(redirect.status, 302);
        assert_eq!(redirect.header("location"), Some("/signin"));
    }

    #[tokio::test]
    async fn test_end_to_end_through_pool() {
        let server = server(false);

        let version = server.test_request(Request::get("/api/version")).await;
        assert_eq!(version.status, 200);
        assert_eq!(version.header("content-type"), Some("application/json"));
        assert_eq!(version.body, br#"{"version":"1.0"}"#);

        let redirect = server.test_request(Request::get("/manage/")).await;
        assert_eq!(redirect.status, 303);
        assert_eq!(redirect.header("Location"), Some("/signin"));

        let failed = server.test_request(Request::get("/fail")).await;
        assert_eq!(failed.status, 500);
        assert_eq!(failed.body, b"Internal Server Error");

        let css = server.test_request(Request::get("/static/site.css")).await;
        assert_eq!(css.status, 200);
        assert_eq!(css.body, b"body{}");

        let spaced = server.test_request(Request::get("/static/print%20me.css")).await;
        assert_eq!(spaced.status, 200);
        assert_eq!(spaced.body, b"p{}");

        let escape = server.test_request(Request::get("/static/../secret")).await;
        assert_eq!(escape.status, 404);

        server.pool.shutdown();
    }

    #[test]
    fn test_debug_mode_shows_error() {
        let server = server(true);
        let failed = tokio_test::block_on(server.test_request(Request::get("/fail")));
        assert_eq!(failed.status, 500);
        assert_eq!(failed.body, b"disk on fire");
        server.pool.shutdown();
    }
}
