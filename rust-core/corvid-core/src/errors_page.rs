//! # Error Pages
//!
//! Rendering of not-found and failure responses.
//!
//! The router never builds error bodies itself; it hands the request and the
//! error to an [`ErrorRenderer`]. The default [`ErrorPages`] looks for
//! `errors/<status>.html` and `<status>.html` in the configured view
//! directories once, at startup, and falls back to a minimal inline page.
//! Clients that ask for JSON get a JSON body instead.

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use hyper::StatusCode;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Statuses for which view files are looked up
const PAGE_STATUSES: [u16; 8] = [401, 403, 404, 413, 419, 422, 500, 503];

/// Collaborator that turns failures into responses
pub trait ErrorRenderer: Send + Sync {
    /// Response for a request no route matched
    fn not_found(&self, req: &Request) -> Response;

    /// Response for an error raised while dispatching
    fn error(&self, req: &Request, err: &Error) -> Response;
}

/// Default renderer backed by optional HTML view files
#[derive(Debug, Clone, Default)]
pub struct ErrorPages {
    pages: HashMap<u16, String>,
}

impl ErrorPages {
    /// Renderer with inline pages only
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload error views from candidate directories
    ///
    /// For each status the first existing file wins, trying
    /// `<dir>/errors/<status>.html` then `<dir>/<status>.html` for every
    /// directory in order. Unreadable files are skipped.
    pub fn from_dirs<P: AsRef<Path>>(dirs: &[P]) -> Self {
        let mut pages = HashMap::new();
        for status in PAGE_STATUSES {
            let candidates = dirs.iter().flat_map(|dir| {
                let dir = dir.as_ref();
                [
                    dir.join("errors").join(format!("{status}.html")),
                    dir.join(format!("{status}.html")),
                ]
            });
            if let Some((path, body)) = candidates
                .filter_map(|path: PathBuf| std::fs::read_to_string(&path).ok().map(|b| (path, b)))
                .next()
            {
                debug!(status, path = %path.display(), "Loaded error view");
                pages.insert(status, body);
            }
        }
        Self { pages }
    }

    /// Whether a view file was loaded for `status`
    #[must_use]
    pub fn has_page(&self, status: u16) -> bool {
        self.pages.contains_key(&status)
    }

    fn render(&self, req: &Request, status: u16, detail: Option<&str>) -> Response {
        let reason = StatusCode::from_u16(status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Error");
        let mut res = Response::new().with_status(status);

        if req.wants_json() {
            let body = json!({
                "error": detail.unwrap_or(reason),
                "status": status,
            });
            // serializing a json! literal cannot fail
            let _ = res.json(&body);
            return res;
        }

        match self.pages.get(&status) {
            Some(page) => res.html(page.clone()),
            None => res.html(format!(
                "<!DOCTYPE html><html><head><title>{status} {reason}</title></head>\
                 <body><h1>{status} {reason}</h1></body></html>"
            )),
        };
        res
    }
}

impl ErrorRenderer for ErrorPages {
    fn not_found(&self, req: &Request) -> Response {
        self.render(req, 404, None)
    }

    fn error(&self, req: &Request, err: &Error) -> Response {
        let status = err.status_code();
        // server-side failures never expose their message
        let detail = (status < 500).then(|| err.to_string());
        self.render(req, status, detail.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Method;
    use std::fs;

    fn json_request() -> Request {
        let headers = HashMap::from([("accept".to_string(), "application/json".to_string())]);
        Request::new(Method::Get, "/missing", headers, None)
    }

    #[test]
    fn test_inline_not_found() {
        let res = ErrorPages::new().not_found(&Request::get("/missing"));
        assert_eq!(res.status, 404);
        assert!(res.content_type.starts_with("text/html"));
        assert!(res.body_text().contains("404 Not Found"));
    }

    #[test]
    fn test_json_not_found() {
        let res = ErrorPages::new().not_found(&json_request());
        assert_eq!(res.status, 404);
        assert_eq!(res.content_type, "application/json");
        assert!(res.body_text().contains("\"status\":404"));
    }

    #[test]
    fn test_view_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("errors")).unwrap();
        fs::write(dir.path().join("errors/404.html"), "<p>nested</p>").unwrap();
        fs::write(dir.path().join("404.html"), "<p>flat</p>").unwrap();
        fs::write(dir.path().join("500.html"), "<p>oops</p>").unwrap();

        let pages = ErrorPages::from_dirs(&[dir.path()]);
        assert!(pages.has_page(404));
        assert!(!pages.has_page(503));

        let res = pages.not_found(&Request::get("/x"));
        assert_eq!(res.body_text(), "<p>nested</p>");

        let res = pages.error(&Request::get("/x"), &Error::Config { message: "boom".into() });
        assert_eq!(res.status, 500);
        assert_eq!(res.body_text(), "<p>oops</p>");
    }

    #[test]
    fn test_server_errors_hide_detail() {
        let err = Error::Config {
            message: "secret dsn".into(),
        };
        let res = ErrorPages::new().error(&json_request(), &err);
        assert_eq!(res.status, 500);
        assert!(!res.body_text().contains("secret dsn"));

        let res = ErrorPages::new().error(&json_request(), &Error::Timeout { millis: 5 });
        assert_eq!(res.status, 504);
    }

    #[test]
    fn test_client_errors_carry_detail() {
        let err = Error::cast("age", "int", "not a number");
        let res = ErrorPages::new().error(&json_request(), &err);
        assert_eq!(res.status, 422);
        assert!(res.body_text().contains("age"));
    }
}
