//! Static file handler for prefix-capture routes.

use crate::handler::{Exchange, HandlerError, HandlerResult, Reply};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Serve files below `root`; the first route capture is the relative path
///
/// ```ignore
/// Module::new().route(RouteDescriptor::new(Method::Get, "/static/*", static_files("static")))
/// ```
pub fn static_files(
    root: impl Into<PathBuf>,
) -> impl Fn(&mut Exchange<'_>, &[String]) -> HandlerResult + Send + Sync + 'static {
    let root = root.into();
    move |_, args| {
        let relative = args.first().map_or("", String::as_str);
        let path = resolve(&root, relative).ok_or_else(HandlerError::not_found)?;
        match std::fs::read(&path) {
            Ok(body) => Ok(Reply::Bytes {
                content_type: content_type(&path).to_string(),
                body,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "static file not found");
                Err(HandlerError::not_found())
            }
            Err(e) => Err(crate::Error::from(e).into()),
        }
    }
}

/// Join `relative` onto `root`, rejecting anything that could escape it
fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let mut path = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (path != root).then_some(path)
}

/// Content type by file extension
fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = Path::new("/srv/static");
        assert_eq!(
            resolve(root, "css/site.css"),
            Some(PathBuf::from("/srv/static/css/site.css"))
        );
        assert_eq!(resolve(root, "./a.js"), Some(PathBuf::from("/srv/static/a.js")));
        assert_eq!(resolve(root, "../etc/passwd"), None);
        assert_eq!(resolve(root, "css/../../x"), None);
        assert_eq!(resolve(root, "/etc/passwd"), None);
        assert_eq!(resolve(root, ""), None);
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("a/site.CSS")), "text/css; charset=utf-8");
        assert_eq!(content_type(Path::new("logo.png")), "image/png");
        assert_eq!(content_type(Path::new("blob")), "application/octet-stream");
    }
}
