//! # HTTP Request
//!
//! Transport-neutral request with lazy parsing.
//!
//! ## Design Principles (SOLID)
//!
//! - **S**: Request only handles request data, not response
//! - **O**: Extensible via new accessors without breaking changes
//! - **D**: Handlers never see hyper types

use crate::error::{Error, Result};
use crate::router::Method;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::OnceLock;

/// HTTP request handed to handlers
///
/// - Query string is parsed on construction
/// - Body is collected once; form input and cookies are parsed on first access
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Request path (without query string)
    pub path: String,
    query_string: Option<String>,
    query_params: HashMap<String, String>,
    headers: HeaderMap,
    body: Option<Bytes>,
    form: OnceLock<HashMap<String, String>>,
    cookies: OnceLock<HashMap<String, String>>,
}

impl Request {
    /// Create a request manually (tests, internal composition)
    ///
    /// `path` may carry a `?query` suffix.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers_map: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        let path = path.into();
        let (path, query_string) = match path.split_once('?') {
            Some((p, q)) => (decode_path(p), Some(q.to_string())),
            None => (decode_path(&path), None),
        };
        let query_params = parse_query_string(query_string.as_deref());

        let mut headers = HeaderMap::new();
        for (k, v) in headers_map {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(&v),
            ) {
                headers.insert(n, v);
            }
        }

        Self {
            method,
            path,
            query_string,
            query_params,
            headers,
            body,
            form: OnceLock::new(),
            cookies: OnceLock::new(),
        }
    }

    /// Shorthand for a bodiless GET
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, HashMap::new(), None)
    }

    /// Create from a hyper request, enforcing a body size limit
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` when the declared or actual body size
    /// exceeds `max_body_size`, `Error::Http` when the body cannot be read.
    pub async fn from_hyper_with_limit(
        req: hyper::Request<hyper::body::Incoming>,
        max_body_size: usize,
    ) -> Result<Self> {
        let method = Method::from(req.method());
        let uri = req.uri();
        let path = decode_path(uri.path());
        let query_string = uri.query().map(String::from);
        let query_params = parse_query_string(query_string.as_deref());

        let headers = req.headers().clone();
        if let Some(content_len) = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok())
        {
            if content_len > max_body_size {
                return Err(Error::PayloadTooLarge {
                    limit: max_body_size,
                    actual: content_len,
                });
            }
        }

        let bytes = BodyExt::collect(req.into_body()).await?.to_bytes();
        if bytes.len() > max_body_size {
            return Err(Error::PayloadTooLarge {
                limit: max_body_size,
                actual: bytes.len(),
            });
        }
        let body = (!bytes.is_empty()).then_some(bytes);

        Ok(Self {
            method,
            path,
            query_string,
            query_params,
            headers,
            body,
            form: OnceLock::new(),
            cookies: OnceLock::new(),
        })
    }

    /// Get a header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set or override a header
    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Query parameter by name
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    /// All query parameters
    #[must_use]
    pub const fn query_map(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Raw query string
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Form field from an urlencoded body, falling back to the query string
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&str> {
        self.form()
            .get(name)
            .or_else(|| self.query_params.get(name))
            .map(String::as_str)
    }

    /// Urlencoded body fields (parsed on first access)
    pub fn form(&self) -> &HashMap<String, String> {
        self.form.get_or_init(|| {
            let is_form = self
                .header("content-type")
                .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
            if is_form {
                parse_query_string(self.body_str())
            } else {
                HashMap::new()
            }
        })
    }

    /// Cookie value by name (parsed on first access)
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies
            .get_or_init(|| parse_cookies(self.header("cookie")))
            .get(name)
            .map(String::as_str)
    }

    /// Deserialize the JSON body
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidJson` if the body is missing or not valid JSON
    /// for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        let mut bytes = self.body_bytes().unwrap_or(b"null").to_vec();
        crate::json::parse_json(&mut bytes)
    }

    /// Request body as bytes
    #[must_use]
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Request body as string (UTF-8)
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        self.body_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }
}

/// Parse query string into HashMap
///
/// Handles URL decoding and duplicate keys (last value wins).
fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (url_decode(key), url_decode(value))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_cookies(header: Option<&str>) -> HashMap<String, String> {
    header
        .map(|h| {
            h.split(';')
                .filter_map(|pair| {
                    let (k, v) = pair.trim().split_once('=')?;
                    Some((k.to_string(), v.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Query-string decoding: `+` is a space
fn url_decode(s: &str) -> String {
    percent_decode(s, true)
}

/// Path decoding: `+` stays literal
fn decode_path(s: &str) -> String {
    percent_decode(s, false)
}

/// Percent-decoding; invalid escapes are kept literally
fn percent_decode(s: &str, plus_as_space: bool) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' if plus_as_space => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        out.push(byte);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_string_simple() {
        let result = parse_query_string(Some("page=1&limit=10"));
        assert_eq!(result.get("page"), Some(&"1".to_string()));
        assert_eq!(result.get("limit"), Some(&"10".to_string()));
    }

    #[test]
    fn test_parse_query_string_empty() {
        assert!(parse_query_string(None).is_empty());
        assert!(parse_query_string(Some("")).is_empty());
    }

    #[test]
    fn test_parse_query_string_url_encoded() {
        let result = parse_query_string(Some("name=John+Doe&city=New%20York"));
        assert_eq!(result.get("name"), Some(&"John Doe".to_string()));
        assert_eq!(result.get("city"), Some(&"New York".to_string()));
    }

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("100%25"), "100%");
        assert_eq!(url_decode("%E4%BD%A0"), "你");
        assert_eq!(url_decode("50%"), "50%");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn test_path_is_percent_decoded() {
        let req = Request::get("/blog/%E4%BD%A0?q=a%2Bb+c");
        assert_eq!(req.path, "/blog/你");
        assert_eq!(req.query("q"), Some("a+b c"));

        assert_eq!(Request::get("/about%20me").path, "/about me");
        assert_eq!(Request::get("/c++/x").path, "/c++/x");
    }

    #[test]
    fn test_path_splits_query() {
        let req = Request::get("/api/?blogs=/api/blogs&page=2");
        assert_eq!(req.path, "/api/");
        assert_eq!(req.query("blogs"), Some("/api/blogs"));
        assert_eq!(req.query("page"), Some("2"));
    }

    #[test]
    fn test_form_input_and_cookie() {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert("cookie".to_string(), "pblog=abc; theme=dark".to_string());
        let req = Request::new(
            Method::Post,
            "/manage/signin?next=/manage/",
            headers,
            Some(Bytes::from_static(b"email=a%40b.com&passwd=x")),
        );

        assert_eq!(req.input("email"), Some("a@b.com"));
        assert_eq!(req.input("next"), Some("/manage/"));
        assert_eq!(req.cookie("theme"), Some("dark"));
        assert_eq!(req.cookie("missing"), None);
    }

    #[test]
    fn test_json_body() {
        let req = Request::new(
            Method::Post,
            "/api/blogs",
            HashMap::new(),
            Some(Bytes::from_static(br#"{"name":"hello"}"#)),
        );
        let value: serde_json::Value = req.json().unwrap();
        assert_eq!(value["name"], "hello");
    }
}
