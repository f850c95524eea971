//! # Route
//!
//! A compiled route: method, source pattern, regex, priority and the call
//! chain (interceptor stages + terminal handler).
//!
//! ## Pattern variants
//!
//! | Variant | Example           | Regex                         | Priority |
//! |---------|-------------------|-------------------------------|----------|
//! | Pattern | `^/blog/\d+$`     | verbatim                      | 1        |
//! | Dynamic | `/blog/:id`       | `^/blog/(?P<id>[^/]+)$`       | 3        |
//! | Static  | `/about`          | `^/about$`                    | 5        |
//! | Prefix  | `/static/*`       | `^/static/(.+)$`              | 7        |

use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::interceptor::InterceptorId;
use crate::module::{RouteDescriptor, RouteShape};
use crate::router::Method;
use regex::{Regex, RegexBuilder};
use std::sync::OnceLock;

/// Route variant, decides translation and priority
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Raw regex, starts with `^`
    Pattern,
    /// Contains `:name` segments
    Dynamic,
    /// Literal path
    Static,
    /// Literal prefix, captures the rest
    Prefix,
}

impl RouteKind {
    /// Match priority; higher is tried first
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Pattern => 1,
            Self::Dynamic => 3,
            Self::Static => 5,
            Self::Prefix => 7,
        }
    }
}

fn route_var() -> &'static Regex {
    static RE_ROUTE: OnceLock<Regex> = OnceLock::new();
    RE_ROUTE.get_or_init(|| Regex::new(r":([a-zA-Z_]\w*)").expect("static regex is valid"))
}

/// Registered route
pub struct Route {
    method: Method,
    pattern: String,
    normalized: String,
    kind: RouteKind,
    regex: Regex,
    ignore_interceptors: bool,
    case_insensitive: bool,
    callback: Handler,
    pub(crate) stages: Vec<InterceptorId>,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("pattern", &self.pattern)
            .field("kind", &self.kind)
            .field("regex", &self.regex.as_str())
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

impl Route {
    /// Compile a descriptor into a route with an empty call chain
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern` if the pattern is empty, has more
    /// than one `*`, or does not compile.
    pub fn compile(descriptor: RouteDescriptor) -> Result<Self> {
        let RouteDescriptor {
            method,
            shape,
            callback,
            ignore_interceptors,
            case_insensitive,
        } = descriptor;

        let (pattern, kind, source) = match shape {
            RouteShape::Template(pattern) => {
                let (kind, source) = translate(&pattern)?;
                (pattern, kind, source)
            }
            RouteShape::Prefix { prefix, suffix } => {
                let source = prefix_regex(&prefix, &suffix);
                (format!("{prefix}*{suffix}"), RouteKind::Prefix, source)
            }
        };

        let regex = RegexBuilder::new(&source)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| Error::InvalidRoutePattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;

        let normalized = if case_insensitive {
            pattern.to_lowercase()
        } else {
            pattern.clone()
        };

        Ok(Self {
            method,
            pattern,
            normalized,
            kind,
            regex,
            ignore_interceptors,
            case_insensitive,
            callback,
            stages: Vec::new(),
        })
    }

    /// Captured groups if `path` matches, positional
    ///
    /// Groups that did not participate in the match are empty strings.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<Vec<String>> {
        let caps = self.regex.captures(path)?;
        Some(
            caps.iter()
                .skip(1)
                .map(|m| m.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect(),
        )
    }

    /// Whether registering `self` next to `existing` would be a conflict
    #[must_use]
    pub fn conflicts_with(&self, existing: &Self) -> bool {
        if self.method != existing.method {
            return false;
        }
        self.normalized == existing.normalized
            || ((self.case_insensitive || existing.case_insensitive)
                && self.pattern.eq_ignore_ascii_case(&existing.pattern))
    }

    /// Identity: method and normalized pattern
    #[must_use]
    pub fn identity(&self) -> (Method, &str) {
        (self.method, &self.normalized)
    }

    /// HTTP method
    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Source pattern as declared
    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Pattern lower-cased for case-insensitive routes
    #[must_use]
    pub fn normalized_pattern(&self) -> &str {
        &self.normalized
    }

    /// Variant
    #[must_use]
    pub const fn kind(&self) -> RouteKind {
        self.kind
    }

    /// Match priority
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.kind.priority()
    }

    /// Compiled regex source
    #[must_use]
    pub fn regex(&self) -> &str {
        self.regex.as_str()
    }

    /// Whether interceptors skip this route
    #[must_use]
    pub const fn ignores_interceptors(&self) -> bool {
        self.ignore_interceptors
    }

    /// Interceptor ids, outermost first
    #[must_use]
    pub fn stages(&self) -> &[InterceptorId] {
        &self.stages
    }

    /// Terminal handler, never wrapped
    #[must_use]
    pub const fn callback(&self) -> &Handler {
        &self.callback
    }
}

/// Classify a template and build its regex source
fn translate(pattern: &str) -> Result<(RouteKind, String)> {
    let invalid = |reason: &str| Error::InvalidRoutePattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if pattern.is_empty() {
        return Err(invalid("pattern is empty"));
    }
    if pattern.starts_with('^') {
        return Ok((RouteKind::Pattern, pattern.to_string()));
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if suffix.contains('*') {
            return Err(invalid("at most one '*' is allowed"));
        }
        return Ok((RouteKind::Prefix, prefix_regex(prefix, suffix)));
    }
    if route_var().is_match(pattern) {
        return Ok((RouteKind::Dynamic, dynamic_regex(pattern)));
    }
    Ok((RouteKind::Static, format!("^{}$", regex::escape(pattern))))
}

fn dynamic_regex(pattern: &str) -> String {
    let mut source = String::from("^");
    let mut last = 0;
    for caps in route_var().captures_iter(pattern) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        source.push_str(&regex::escape(&pattern[last..whole.start()]));
        source.push_str("(?P<");
        source.push_str(name.as_str());
        source.push_str(">[^/]+)");
        last = whole.end();
    }
    source.push_str(&regex::escape(&pattern[last..]));
    source.push('$');
    source
}

fn prefix_regex(prefix: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("^{}(.+)$", regex::escape(prefix))
    } else {
        format!("^{}({})$", regex::escape(prefix), regex::escape(suffix))
    }
}
