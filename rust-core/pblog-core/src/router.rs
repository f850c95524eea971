//! # Route Table
//!
//! Per-method ordered route buckets. Matching is a linear scan in priority
//! order; the first route whose regex matches wins.
//!
//! ## SOLID Principles
//!
//! - **S**: RouteTable only stores and orders routes; pattern compilation
//!   lives in `route`
//! - **O**: New route variants only need a priority

use crate::error::{Error, Result};
use crate::route::Route;
use std::collections::HashMap;
use std::str::FromStr;

/// HTTP methods supported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// HTTP GET
    Get,
    /// HTTP POST
    Post,
    /// HTTP PUT
    Put,
    /// HTTP DELETE
    Delete,
    /// HTTP PATCH
    Patch,
    /// HTTP HEAD
    Head,
    /// HTTP OPTIONS
    Options,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Get => write!(f, "GET"),
            Self::Post => write!(f, "POST"),
            Self::Put => write!(f, "PUT"),
            Self::Delete => write!(f, "DELETE"),
            Self::Patch => write!(f, "PATCH"),
            Self::Head => write!(f, "HEAD"),
            Self::Options => write!(f, "OPTIONS"),
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            "PATCH" => Ok(Self::Patch),
            "HEAD" => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            other => Err(Error::InvalidRoutePattern {
                pattern: other.to_string(),
                reason: "unsupported HTTP method".to_string(),
            }),
        }
    }
}

impl From<&hyper::Method> for Method {
    fn from(method: &hyper::Method) -> Self {
        match *method {
            hyper::Method::POST => Self::Post,
            hyper::Method::PUT => Self::Put,
            hyper::Method::DELETE => Self::Delete,
            hyper::Method::PATCH => Self::Patch,
            hyper::Method::HEAD => Self::Head,
            hyper::Method::OPTIONS => Self::Options,
            _ => Self::Get,
        }
    }
}

/// Routes bucketed by method, each bucket sorted by descending priority
///
/// Ties keep registration order (stable sort).
#[derive(Debug, Default)]
pub struct RouteTable {
    buckets: HashMap<Method, Vec<Route>>,
}

impl RouteTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route and re-sort its bucket
    ///
    /// # Errors
    ///
    /// Returns `Error::RouteConflict` if a route with the same identity is
    /// already registered for the method.
    pub fn register(&mut self, route: Route) -> Result<()> {
        let bucket = self.buckets.entry(route.method()).or_default();
        if bucket.iter().any(|existing| route.conflicts_with(existing)) {
            return Err(Error::RouteConflict {
                method: route.method(),
                pattern: route.pattern().to_string(),
            });
        }
        bucket.push(route);
        bucket.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Ok(())
    }

    /// First route of the method's bucket matching `path`, with its captures
    #[must_use]
    pub fn find_route(&self, method: Method, path: &str) -> Option<(&Route, Vec<String>)> {
        self.buckets
            .get(&method)?
            .iter()
            .find_map(|route| route.matches(path).map(|args| (route, args)))
    }

    /// Routes registered for a method, in match order
    #[must_use]
    pub fn routes(&self, method: Method) -> &[Route] {
        self.buckets.get(&method).map_or(&[], Vec::as_slice)
    }

    /// All routes, grouped by method in a stable method order
    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        let mut methods: Vec<_> = self.buckets.keys().copied().collect();
        methods.sort();
        methods.into_iter().flat_map(|m| self.routes(m))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Route> {
        self.buckets.values_mut().flatten()
    }

    /// Total number of routes
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    /// Whether no route is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Reply;
    use crate::module::RouteDescriptor;

    fn route(method: Method, pattern: &str) -> Route {
        Route::compile(RouteDescriptor::new(method, pattern, |_, _| {
            Ok(Reply::text("x"))
        }))
        .unwrap()
    }

    #[test]
    fn test_method_parse_and_display() {
        assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
        assert_eq!("DELETE".parse::<Method>().unwrap(), Method::Delete);
        assert!("BREW".parse::<Method>().is_err());
        assert_eq!(Method::Options.to_string(), "OPTIONS");
        assert_eq!(Method::from(&hyper::Method::POST), Method::Post);
    }

    #[test]
    fn test_priority_order_and_stable_ties() {
        let mut table = RouteTable::new();
        table.register(route(Method::Get, "^/blog/.*$")).unwrap();
        table.register(route(Method::Get, "/blog/:id")).unwrap();
        table.register(route(Method::Get, "/blog/latest")).unwrap();
        table.register(route(Method::Get, "/static/*")).unwrap();
        table.register(route(Method::Get, "/about")).unwrap();

        let order: Vec<_> = table.routes(Method::Get).iter().map(Route::pattern).collect();
        assert_eq!(
            order,
            vec!["/static/*", "/blog/latest", "/about", "/blog/:id", "^/blog/.*$"]
        );
    }

    #[test]
    fn test_higher_priority_wins() {
        let mut table = RouteTable::new();
        table.register(route(Method::Get, "/blog/:id")).unwrap();
        table.register(route(Method::Get, "/blog/latest")).unwrap();

        let (found, args) = table.find_route(Method::Get, "/blog/latest").unwrap();
        assert_eq!(found.pattern(), "/blog/latest");
        assert!(args.is_empty());

        let (found, args) = table.find_route(Method::Get, "/blog/42").unwrap();
        assert_eq!(found.pattern(), "/blog/:id");
        assert_eq!(args, vec!["42"]);
    }

    #[test]
    fn test_not_found_and_method_isolation() {
        let mut table = RouteTable::new();
        table.register(route(Method::Get, "/users")).unwrap();

        assert!(table.find_route(Method::Get, "/nonexistent").is_none());
        assert!(table.find_route(Method::Post, "/users").is_none());
    }

    #[test]
    fn test_duplicate_route_conflicts() {
        let mut table = RouteTable::new();
        table.register(route(Method::Get, "/about")).unwrap();
        table.register(route(Method::Post, "/about")).unwrap();

        let err = table.register(route(Method::Get, "/about")).unwrap_err();
        assert!(matches!(err, Error::RouteConflict { method: Method::Get, .. }));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_case_insensitive_conflict() {
        let mut table = RouteTable::new();
        table.register(route(Method::Get, "/About")).unwrap();

        let ci = Route::compile(
            RouteDescriptor::new(Method::Get, "/about", |_, _| Ok(Reply::text("y")))
                .case_insensitive(),
        )
        .unwrap();
        assert!(matches!(
            table.register(ci),
            Err(Error::RouteConflict { .. })
        ));

        // case-sensitive routes differing only by case coexist
        table.register(route(Method::Get, "/ABOUT")).unwrap();
    }
}
