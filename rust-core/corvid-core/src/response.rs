//! # HTTP Response
//!
//! Response builder shared by middleware and handlers.
//!
//! Terminal operations (`json`, `html`, `text`, `redirect`, `download`)
//! write the body and end the response: later writes to the body, status or
//! headers are ignored and logged.

use crate::error::Result;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response as HyperResponse, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

/// `Set-Cookie` description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    max_age: Option<i64>,
    http_only: bool,
    secure: bool,
    same_site: Option<String>,
}

impl Cookie {
    /// Create a cookie with path `/`
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: Some("/".to_string()),
            max_age: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }

    /// Set the cookie path
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set Max-Age in seconds
    #[must_use]
    pub const fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Mark HttpOnly
    #[must_use]
    pub const fn http_only(mut self) -> Self {
        self.http_only = true;
        self
    }

    /// Mark Secure
    #[must_use]
    pub const fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Set SameSite (Lax, Strict, None)
    #[must_use]
    pub fn same_site(mut self, policy: impl Into<String>) -> Self {
        self.same_site = Some(policy.into());
        self
    }

    /// Render as a `Set-Cookie` header value
    #[must_use]
    pub fn to_header(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(path) = &self.path {
            out.push_str(&format!("; Path={path}"));
        }
        if let Some(age) = self.max_age {
            out.push_str(&format!("; Max-Age={age}"));
        }
        if self.http_only {
            out.push_str("; HttpOnly");
        }
        if self.secure {
            out.push_str("; Secure");
        }
        if let Some(policy) = &self.same_site {
            out.push_str(&format!("; SameSite={policy}"));
        }
        out
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code
    pub status: u16,
    /// Response body
    pub body: Bytes,
    /// Content type
    pub content_type: String,
    /// Response headers
    pub headers: HashMap<String, String>,
    cookies: Vec<Cookie>,
    finished: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            body: Bytes::new(),
            content_type: "text/plain; charset=utf-8".to_string(),
            headers: HashMap::new(),
            cookies: Vec::new(),
            finished: false,
        }
    }
}

impl Response {
    /// Create an empty 200 response
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set status code
    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set header
    #[must_use]
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.set_header(key, value);
        self
    }

    /// Whether a terminal operation already ran
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Body as UTF-8 text (lossy)
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Header value by name (case-insensitive)
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        if key.eq_ignore_ascii_case("content-type") {
            return Some(&self.content_type);
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Cookies queued on this response
    #[must_use]
    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    fn writable(&self, what: &str) -> bool {
        if self.finished {
            warn!(status = self.status, write = what, "Write to finished response ignored");
        }
        !self.finished
    }

    /// Set status code
    pub fn set_status(&mut self, status: u16) -> &mut Self {
        if self.writable("status") {
            self.status = status;
        }
        self
    }

    /// Set or override a header
    pub fn set_header(&mut self, key: &str, value: &str) -> &mut Self {
        if self.writable("header") {
            self.insert_header(key, value);
        }
        self
    }

    pub(crate) fn insert_header(&mut self, key: &str, value: &str) {
        if key.eq_ignore_ascii_case("content-type") {
            self.content_type = value.to_string();
        } else {
            self.headers.insert(key.to_string(), value.to_string());
        }
    }

    /// Queue a `Set-Cookie` header
    pub fn cookie(&mut self, cookie: Cookie) -> &mut Self {
        if self.writable("cookie") {
            self.cookies.push(cookie);
        }
        self
    }

    fn finish(&mut self, content_type: &str, body: Bytes) {
        self.content_type = content_type.to_string();
        self.body = body;
        self.finished = true;
    }

    /// Send a JSON body and end the response
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the value cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self> {
        if self.writable("json") {
            let body = serde_json::to_vec(value)?;
            self.finish("application/json", Bytes::from(body));
        }
        Ok(self)
    }

    /// Send an HTML body and end the response
    pub fn html(&mut self, html: impl Into<String>) -> &mut Self {
        if self.writable("html") {
            self.finish("text/html; charset=utf-8", Bytes::from(html.into()));
        }
        self
    }

    /// Send a plain-text body and end the response
    pub fn text(&mut self, text: impl Into<String>) -> &mut Self {
        if self.writable("text") {
            self.finish("text/plain; charset=utf-8", Bytes::from(text.into()));
        }
        self
    }

    /// Redirect to `location` (302 unless another 3xx is given) and end the response
    pub fn redirect(&mut self, location: &str, status: Option<u16>) -> &mut Self {
        if self.writable("redirect") {
            self.status = status.filter(|s| (300..400).contains(s)).unwrap_or(302);
            self.insert_header("Location", location);
            self.finish("text/plain; charset=utf-8", Bytes::new());
        }
        self
    }

    /// Send bytes as a file attachment and end the response
    pub fn download(&mut self, data: impl Into<Bytes>, filename: &str) -> &mut Self {
        if self.writable("download") {
            let safe_name: String = filename
                .chars()
                .filter(|c| *c != '"' && *c != '\r' && *c != '\n')
                .collect();
            self.insert_header(
                "Content-Disposition",
                &format!("attachment; filename=\"{safe_name}\""),
            );
            self.finish("application/octet-stream", data.into());
        }
        self
    }

    /// Convert to hyper Response
    pub(crate) fn into_hyper(self) -> HyperResponse<Full<Bytes>> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = HyperResponse::builder()
            .status(status)
            .header("Content-Type", &self.content_type);
        for (k, v) in &self.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        for cookie in &self.cookies {
            builder = builder.header("Set-Cookie", cookie.to_header());
        }

        builder
            .body(Full::new(self.body))
            .unwrap_or_else(|_| {
                let mut fallback = HyperResponse::new(Full::new(Bytes::from("Internal Server Error")));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_response() {
        let mut res = Response::new();
        res.json(&json!({"status": "ok"})).unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.content_type, "application/json");
        assert_eq!(res.body_text(), r#"{"status":"ok"}"#);
        assert!(res.is_finished());
    }

    #[test]
    fn test_with_status() {
        let res = Response::new().with_status(404);
        assert_eq!(res.status, 404);
    }

    #[test]
    fn test_writes_after_terminal_are_ignored() {
        let mut res = Response::new();
        res.set_status(201).text("created");
        res.set_status(500).html("<p>late</p>").set_header("X-Late", "1");

        assert_eq!(res.status, 201);
        assert_eq!(res.body_text(), "created");
        assert!(res.header("x-late").is_none());
    }

    #[test]
    fn test_redirect() {
        let mut res = Response::new();
        res.redirect("/login", None);
        assert_eq!(res.status, 302);
        assert_eq!(res.header("location"), Some("/login"));

        let mut res = Response::new();
        res.redirect("/moved", Some(301));
        assert_eq!(res.status, 301);

        let mut res = Response::new();
        res.redirect("/bad", Some(200));
        assert_eq!(res.status, 302);
    }

    #[test]
    fn test_download() {
        let mut res = Response::new();
        res.download(Bytes::from_static(b"a,b\n1,2\n"), "report\".csv");
        assert_eq!(res.content_type, "application/octet-stream");
        assert_eq!(
            res.header("content-disposition"),
            Some("attachment; filename=\"report.csv\"")
        );
    }

    #[test]
    fn test_cookie_header() {
        let cookie = Cookie::new("XSRF-TOKEN", "abc")
            .max_age(3600)
            .http_only()
            .secure()
            .same_site("Lax");
        assert_eq!(
            cookie.to_header(),
            "XSRF-TOKEN=abc; Path=/; Max-Age=3600; HttpOnly; Secure; SameSite=Lax"
        );

        let mut res = Response::new();
        res.cookie(cookie);
        assert_eq!(res.cookies().len(), 1);
    }

    #[test]
    fn test_into_hyper() {
        let mut res = Response::new().with_header("X-Request-Id", "r1");
        res.cookie(Cookie::new("a", "1")).cookie(Cookie::new("b", "2"));
        res.set_status(201).text("done");

        let hyper_res = res.into_hyper();
        assert_eq!(hyper_res.status(), StatusCode::CREATED);
        assert_eq!(hyper_res.headers().get_all("set-cookie").iter().count(), 2);
        assert_eq!(hyper_res.headers().get("x-request-id").unwrap(), "r1");
    }
}
