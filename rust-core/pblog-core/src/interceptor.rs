//! # Interceptors
//!
//! Named cross-cutting wrappers applied to every route whose pattern matches
//! the interceptor's scope.
//!
//! ## Design Principles (SOLID)
//!
//! - **S**: Each interceptor has a single responsibility
//! - **O**: New interceptors are plain closures, no trait to implement
//! - **D**: Routes store interceptor ids, never nested closures
//!
//! A route's call chain is its stage list (outermost first) followed by its
//! terminal handler. [`Next`] walks that list; a stage that returns without
//! calling [`Next::run`] short-circuits the rest of the chain.

use crate::error::{Error, Result};
use crate::handler::{Exchange, HandlerResult};
use crate::module::InterceptorDescriptor;
use crate::route::Route;
use crate::router::Method;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{info, warn};

/// Index of an interceptor in the registry's arena
pub type InterceptorId = usize;

/// Interceptor body
pub type InterceptorFn = Arc<dyn Fn(&mut Exchange<'_>, Next<'_>) -> HandlerResult + Send + Sync>;

fn scope_syntax() -> &'static Regex {
    static RE_INTERCEPTOR: OnceLock<Regex> = OnceLock::new();
    RE_INTERCEPTOR
        .get_or_init(|| Regex::new(r"^(\*?)([^*?]+)(\*?)$").expect("static regex is valid"))
}

/// Compile an interceptor scope pattern into a case-insensitive matcher
///
/// `/manage/` becomes `^/manage/.*$`, `/manage/*` becomes `^/manage/.+$` and
/// `*/edit` becomes `^.+/edit.*$`.
///
/// # Errors
///
/// Returns `Error::InvalidInterceptorPattern` if the pattern is empty or has a
/// `*` or `?` anywhere but the ends.
pub fn compile_scope(pattern: &str) -> Result<Regex> {
    let invalid = || Error::InvalidInterceptorPattern {
        pattern: pattern.to_string(),
    };
    let caps = scope_syntax().captures(pattern).ok_or_else(invalid)?;
    let leading = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
    let literal = caps.get(2).map_or("", |m| m.as_str());
    let trailing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());

    let source = format!(
        "^{}{}{}$",
        if leading { ".+" } else { "" },
        regex::escape(literal),
        if trailing { ".+" } else { ".*" },
    );
    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|_| invalid())
}

/// Registered interceptor
pub struct Interceptor {
    name: String,
    pattern: String,
    matcher: Regex,
    callback: InterceptorFn,
    applied: HashSet<(Method, String)>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("name", &self.name)
            .field("pattern", &self.pattern)
            .field("matcher", &self.matcher.as_str())
            .field("applied", &self.applied.len())
            .finish_non_exhaustive()
    }
}

impl Interceptor {
    /// Compile a descriptor
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInterceptorPattern` for a malformed scope.
    pub fn compile(descriptor: InterceptorDescriptor) -> Result<Self> {
        let matcher = compile_scope(&descriptor.pattern)?;
        Ok(Self {
            name: descriptor.name,
            pattern: descriptor.pattern,
            matcher,
            callback: descriptor.callback,
            applied: HashSet::new(),
        })
    }

    /// Interceptor name (its identity)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scope pattern as declared
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Whether a route pattern falls in this interceptor's scope
    #[must_use]
    pub fn matches(&self, route_pattern: &str) -> bool {
        self.matcher.is_match(route_pattern)
    }

    /// Consider a route once: returns `true` if it should get this stage
    ///
    /// The pair is remembered whether or not it matched.
    pub(crate) fn visit(&mut self, route: &Route) -> bool {
        let (method, pattern) = route.identity();
        if !self.applied.insert((method, pattern.to_string())) {
            return false;
        }
        !route.ignores_interceptors() && self.matches(pattern)
    }
}

/// The rest of a route's call chain
pub struct Next<'r> {
    interceptors: &'r [Interceptor],
    route: &'r Route,
    stages: &'r [InterceptorId],
    args: &'r [String],
}

impl<'r> Next<'r> {
    pub(crate) fn new(interceptors: &'r [Interceptor], route: &'r Route, args: &'r [String]) -> Self {
        Self {
            interceptors,
            route,
            stages: route.stages(),
            args,
        }
    }

    /// Run the next stage, or the terminal handler when none are left
    ///
    /// # Errors
    ///
    /// Whatever the remaining stages or the handler return.
    pub fn run(self, exchange: &mut Exchange<'_>) -> HandlerResult {
        let Some((&id, rest)) = self.stages.split_first() else {
            return (self.route.callback())(exchange, self.args);
        };
        let next = Self {
            stages: rest,
            ..self
        };
        match self.interceptors.get(id) {
            Some(interceptor) => (interceptor.callback)(exchange, next),
            None => {
                warn!(id, "unknown interceptor stage skipped");
                next.run(exchange)
            }
        }
    }

    /// Captured arguments of the matched route
    #[must_use]
    pub const fn args(&self) -> &[String] {
        self.args
    }

    /// The matched route
    #[must_use]
    pub const fn route(&self) -> &Route {
        self.route
    }
}

/// Request log with outcome and elapsed time
///
/// Registered like any other interceptor; `pattern` picks its scope.
#[must_use]
pub fn access_log(pattern: impl Into<String>) -> InterceptorDescriptor {
    InterceptorDescriptor::new("access_log", pattern, |exchange, next| {
        let start = Instant::now();
        let request = exchange.request();
        let route = next.route().pattern().to_string();
        let result = next.run(exchange);
        let status = match &result {
            Ok(reply) => reply.status(),
            Err(e) => e.status(),
        };
        info!(
            method = %request.method,
            path = %request.path,
            route = %route,
            status,
            duration_ms = %start.elapsed().as_millis(),
            "Request handled"
        );
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pattern: &str) -> Regex {
        compile_scope(pattern).unwrap()
    }

    #[test]
    fn test_plain_scope_is_prefix() {
        let re = scope("/manage/");
        assert_eq!(re.as_str(), "^/manage/.*$");
        assert!(re.is_match("/manage/"));
        assert!(re.is_match("/manage/blogs"));
        assert!(re.is_match("/MANAGE/Blogs"));
        assert!(!re.is_match("/public/"));
    }

    #[test]
    fn test_trailing_star_requires_more() {
        let re = scope("/manage/*");
        assert!(!re.is_match("/manage/"));
        assert!(re.is_match("/manage/blogs"));
    }

    #[test]
    fn test_leading_star_allows_anything_before() {
        let re = scope("*/edit");
        assert!(re.is_match("/manage/blogs/edit"));
        assert!(!re.is_match("/edit"));
    }

    #[test]
    fn test_literal_is_escaped() {
        let re = scope("/a.b");
        assert!(re.is_match("/a.b/c"));
        assert!(!re.is_match("/axb"));
    }

    #[test]
    fn test_invalid_scopes() {
        for bad in ["", "*", "**", "/a*b", "/a?", "/x**"] {
            assert!(
                matches!(compile_scope(bad), Err(Error::InvalidInterceptorPattern { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
