//! # Handlers
//!
//! The values a handler sees and returns: [`Exchange`] (request, connection
//! context, per-request extensions), [`Reply`] and [`HandlerError`].

use crate::context::ConnectionContext;
use crate::dispatcher::Registry;
use crate::error::Error;
use crate::request::Request;
use crate::router::Method;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Terminal route handler; receives the positional captures of the route
pub type Handler = Arc<dyn Fn(&mut Exchange<'_>, &[String]) -> HandlerResult + Send + Sync>;

/// What every handler and interceptor returns
pub type HandlerResult = std::result::Result<Reply, HandlerError>;

/// Outcome of resolving a request
#[derive(Debug)]
pub enum Dispatch {
    /// A route matched and its call chain produced a reply
    Handled(Reply),
    /// No route matched
    NotFound,
}

/// Handler reply body
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `application/json`
    Json(Value),
    /// `text/plain`
    Text(String),
    /// `text/html`
    Html(String),
    /// Arbitrary bytes with a content type
    Bytes {
        /// Content-Type header value
        content_type: String,
        /// Body
        body: Vec<u8>,
    },
    /// 204 with no body
    NoContent,
}

impl Reply {
    /// Plain text reply
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    /// HTML reply
    pub fn html(body: impl Into<String>) -> Self {
        Self::Html(body.into())
    }

    /// Serialize a value as a JSON reply
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the value cannot be represented as JSON.
    pub fn json<T: Serialize>(value: &T) -> crate::Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Content-Type header value
    #[must_use]
    pub fn content_type(&self) -> &str {
        match self {
            Self::Json(_) => "application/json",
            Self::Text(_) | Self::NoContent => "text/plain; charset=utf-8",
            Self::Html(_) => "text/html; charset=utf-8",
            Self::Bytes { content_type, .. } => content_type,
        }
    }

    /// HTTP status for a successful reply
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::NoContent => 204,
            _ => 200,
        }
    }

    /// Body bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if a JSON value fails to serialize.
    pub fn into_body(self) -> crate::Result<Vec<u8>> {
        Ok(match self {
            Self::Json(value) => serde_json::to_vec(&value)?,
            Self::Text(s) | Self::Html(s) => s.into_bytes(),
            Self::Bytes { body, .. } => body,
            Self::NoContent => Vec::new(),
        })
    }
}

/// Errors raised by handlers and interceptors
///
/// The dispatch core passes these through untouched; the server maps them
/// to HTTP responses.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Redirect the client
    #[error("redirect {status} to {location}")]
    Redirect {
        /// 301, 302, 303 or 307
        status: u16,
        /// Location header
        location: String,
    },

    /// Fail with an HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Reason shown to the client
        message: String,
    },

    /// Framework error
    #[error(transparent)]
    Core(#[from] Error),

    /// Anything else a handler wants to bubble up
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// `303 See Other`
    pub fn see_other(location: impl Into<String>) -> Self {
        Self::Redirect {
            status: 303,
            location: location.into(),
        }
    }

    /// `302 Found`
    pub fn found(location: impl Into<String>) -> Self {
        Self::Redirect {
            status: 302,
            location: location.into(),
        }
    }

    /// `400 Bad Request`
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: 400,
            message: message.into(),
        }
    }

    /// `403 Forbidden`
    #[must_use]
    pub fn forbidden() -> Self {
        Self::Http {
            status: 403,
            message: "Forbidden".to_string(),
        }
    }

    /// `404 Not Found`
    #[must_use]
    pub fn not_found() -> Self {
        Self::Http {
            status: 404,
            message: "Not Found".to_string(),
        }
    }

    /// Status the server should answer with
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Redirect { status, .. } | Self::Http { status, .. } => *status,
            Self::Core(Error::RouteNotFound { .. }) => 404,
            Self::Core(Error::PayloadTooLarge { .. }) => 413,
            Self::Core(Error::InvalidJson { .. }) => 400,
            Self::Core(_) | Self::Other(_) => 500,
        }
    }
}

/// Per-request typed values set by interceptors for later stages
///
/// Keyed by type, one value per type.
#[derive(Default)]
pub struct Extensions {
    data: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl Extensions {
    /// Create an empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value by its type, returning the previous one
    pub fn insert<T: Send + 'static>(&mut self, value: T) -> Option<T> {
        self.data
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    /// Borrow a value by type
    #[must_use]
    pub fn get<T: Send + 'static>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    /// Mutably borrow a value by type
    pub fn get_mut<T: Send + 'static>(&mut self) -> Option<&mut T> {
        self.data
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    /// Mutably borrow a value by type, inserting the default first if absent
    pub fn get_or_default<T: Default + Send + 'static>(&mut self) -> &mut T {
        let slot = self
            .data
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()));
        match slot.downcast_mut::<T>() {
            Some(value) => value,
            None => unreachable!("extension slot is keyed by its own TypeId"),
        }
    }

    /// Remove a value by type
    pub fn remove<T: Send + 'static>(&mut self) -> Option<T> {
        self.data
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    /// Check if a type exists
    #[must_use]
    pub fn contains<T: 'static>(&self) -> bool {
        self.data.contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extensions")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Everything a handler gets for one request
pub struct Exchange<'a> {
    request: &'a Request,
    db: &'a mut ConnectionContext,
    registry: &'a Registry,
    /// Values shared between interceptors and the handler
    pub extensions: Extensions,
}

impl<'a> Exchange<'a> {
    /// Bundle a request with a worker's connection context
    pub fn new(request: &'a Request, db: &'a mut ConnectionContext, registry: &'a Registry) -> Self {
        Self {
            request,
            db,
            registry,
            extensions: Extensions::new(),
        }
    }

    /// The request being handled
    #[must_use]
    pub const fn request(&self) -> &'a Request {
        self.request
    }

    /// The worker's connection context
    pub fn db(&mut self) -> &mut ConnectionContext {
        self.db
    }

    /// Whether the dispatcher runs in debug mode
    #[must_use]
    pub const fn debug(&self) -> bool {
        self.registry.debug()
    }

    /// Resolve `(method, path)` and call the route's unwrapped handler
    ///
    /// Interceptors are skipped. Used to compose several API results into
    /// one response on the server side.
    ///
    /// # Errors
    ///
    /// Returns `Error::RouteNotFound` when nothing matches, otherwise the
    /// handler's own error.
    pub fn internal_dispatch(&mut self, method: Method, path: &str) -> HandlerResult {
        let registry = self.registry;
        let Some((route, args)) = registry.find_route(method, path) else {
            return Err(Error::RouteNotFound {
                method,
                path: path.to_string(),
            }
            .into());
        };
        (route.callback())(self, &args)
    }
}
