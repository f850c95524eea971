//! # Modules
//!
//! Declaration-time builders. A [`Module`] is a named bundle of
//! [`RouteDescriptor`]s and [`InterceptorDescriptor`]s; the dispatcher consumes
//! these values during bootstrap and never inspects handlers for metadata.

use crate::handler::{Exchange, Handler, HandlerResult};
use crate::interceptor::{InterceptorFn, Next};
use crate::router::Method;
use std::sync::Arc;

/// How a route's pattern is given
#[derive(Debug, Clone)]
pub enum RouteShape {
    /// Template string; the variant is inferred from its syntax
    Template(String),
    /// Explicit literal prefix with an optional literal suffix
    Prefix {
        /// Literal text before the capture
        prefix: String,
        /// Literal text after the capture
        suffix: String,
    },
}

/// A route as declared by a module
pub struct RouteDescriptor {
    pub(crate) method: Method,
    pub(crate) shape: RouteShape,
    pub(crate) callback: Handler,
    pub(crate) ignore_interceptors: bool,
    pub(crate) case_insensitive: bool,
}

impl RouteDescriptor {
    /// Route from a template (`/about`, `/blog/:id`, `/static/*`, `^regex`)
    pub fn new<F>(method: Method, pattern: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange<'_>, &[String]) -> HandlerResult + Send + Sync + 'static,
    {
        Self::with_handler(method, pattern, Arc::new(f))
    }

    /// Route from a template with an already shared handler
    pub fn with_handler(method: Method, pattern: impl Into<String>, callback: Handler) -> Self {
        Self {
            method,
            shape: RouteShape::Template(pattern.into()),
            callback,
            ignore_interceptors: false,
            case_insensitive: false,
        }
    }

    /// Prefix-capture route: `prefix` + captured rest (+ `suffix`)
    pub fn prefix<F>(
        method: Method,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
        f: F,
    ) -> Self
    where
        F: Fn(&mut Exchange<'_>, &[String]) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            method,
            shape: RouteShape::Prefix {
                prefix: prefix.into(),
                suffix: suffix.into(),
            },
            callback: Arc::new(f),
            ignore_interceptors: false,
            case_insensitive: false,
        }
    }

    /// Opt this route out of every interceptor
    #[must_use]
    pub const fn ignore_interceptors(mut self) -> Self {
        self.ignore_interceptors = true;
        self
    }

    /// Match paths ignoring ASCII case
    #[must_use]
    pub const fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Declared method
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }
}

impl std::fmt::Debug for RouteDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteDescriptor")
            .field("method", &self.method)
            .field("shape", &self.shape)
            .field("ignore_interceptors", &self.ignore_interceptors)
            .field("case_insensitive", &self.case_insensitive)
            .finish_non_exhaustive()
    }
}

/// An interceptor as declared by a module
///
/// `pattern` is `*?literal*?`: a trailing `*` requires at least one more
/// character, a leading `*` allows anything before the literal.
pub struct InterceptorDescriptor {
    pub(crate) name: String,
    pub(crate) pattern: String,
    pub(crate) callback: InterceptorFn,
}

impl InterceptorDescriptor {
    /// Named interceptor over routes whose pattern matches `pattern`
    pub fn new<F>(name: impl Into<String>, pattern: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange<'_>, Next<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            callback: Arc::new(f),
        }
    }

    /// Interceptor name (its identity)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for InterceptorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorDescriptor")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

/// Bundle of declarations produced by a module factory
#[derive(Debug, Default)]
pub struct Module {
    routes: Vec<RouteDescriptor>,
    interceptors: Vec<InterceptorDescriptor>,
}

impl Module {
    /// Create an empty module
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route descriptor
    #[must_use]
    pub fn route(mut self, route: RouteDescriptor) -> Self {
        self.routes.push(route);
        self
    }

    /// Add a GET route
    #[must_use]
    pub fn get<F>(self, pattern: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange<'_>, &[String]) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(RouteDescriptor::new(Method::Get, pattern, f))
    }

    /// Add a POST route
    #[must_use]
    pub fn post<F>(self, pattern: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Exchange<'_>, &[String]) -> HandlerResult + Send + Sync + 'static,
    {
        self.route(RouteDescriptor::new(Method::Post, pattern, f))
    }

    /// Add an interceptor descriptor
    #[must_use]
    pub fn interceptor(mut self, interceptor: InterceptorDescriptor) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Declared routes
    #[must_use]
    pub fn routes(&self) -> &[RouteDescriptor] {
        &self.routes
    }

    /// Declared interceptors
    #[must_use]
    pub fn interceptors(&self) -> &[InterceptorDescriptor] {
        &self.interceptors
    }

    pub(crate) fn into_parts(self) -> (Vec<RouteDescriptor>, Vec<InterceptorDescriptor>) {
        (self.routes, self.interceptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Reply;

    #[test]
    fn test_module_builder_collects_descriptors() {
        let module = Module::new()
            .get("/api/version", |_, _| Ok(Reply::text("1")))
            .post("/api/blogs", |_, _| Ok(Reply::NoContent))
            .route(
                RouteDescriptor::new(Method::Get, "/health", |_, _| Ok(Reply::NoContent))
                    .ignore_interceptors(),
            )
            .interceptor(InterceptorDescriptor::new("audit", "/api/", |ex, next| {
                next.run(ex)
            }));

        assert_eq!(module.routes().len(), 3);
        assert_eq!(module.routes()[1].method(), Method::Post);
        assert!(module.routes()[2].ignore_interceptors);
        assert_eq!(module.interceptors()[0].name(), "audit");
    }
}
