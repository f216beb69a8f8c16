//! # HTTP Request
//!
//! Request carrier handed to middleware and handlers.
//!
//! - Headers are kept as a `hyper::HeaderMap` (case-insensitive lookup)
//! - Body is collected once, parsed on demand by content type
//! - Query string is parsed eagerly
//! - An attribute bag lets middleware pass data downstream (e.g. JWT claims)

use crate::error::{Error, Result};
use crate::json::parse_json_bytes;
use crate::router::Method;
use crate::types::Params;
use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::Request as HyperRequest;
use serde_json::Value;
use std::collections::HashMap;

/// Request body interpreted by its `Content-Type`
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedBody {
    /// No body was sent
    Empty,
    /// `application/json`
    Json(Value),
    /// `application/x-www-form-urlencoded`
    Form(HashMap<String, String>),
    /// `application/xml` / `text/xml`, kept as text
    Xml(String),
    /// `multipart/form-data` text fields (files via [`Request::files`])
    Multipart(HashMap<String, String>),
    /// Anything else
    Raw(Bytes),
}

/// A file received in a `multipart/form-data` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Form field name
    pub field: String,
    /// Client-supplied file name
    pub filename: String,
    /// Declared content type of the part
    pub content_type: Option<String>,
    /// File contents
    pub data: Bytes,
}

impl UploadedFile {
    /// Size in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method
    pub method: Method,
    /// Request path (without query string)
    pub path: String,
    /// Raw query string (e.g., "page=1&limit=10")
    query_string: Option<String>,
    /// Parsed query parameters
    query_params: HashMap<String, String>,
    /// Request headers
    headers: hyper::HeaderMap,
    /// Request body (collected)
    body: Option<Bytes>,
    /// Per-request attribute bag
    attributes: HashMap<String, Value>,
    /// Path parameters of the matched route
    params: Params,
}

impl Request {
    /// Create a request manually (for testing/internal use)
    ///
    /// `path` may carry a query string.
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers_map: HashMap<String, String>,
        body: Option<Bytes>,
    ) -> Self {
        let path = path.into();
        let (path, query_string) = match path.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path, None),
        };

        let mut request = Self {
            method,
            path,
            query_params: parse_query_string(query_string.as_deref()),
            query_string,
            headers: hyper::HeaderMap::new(),
            body,
            attributes: HashMap::new(),
            params: Params::new(),
        };
        for (k, v) in headers_map {
            request.set_header(&k, &v);
        }
        request
    }

    /// Shorthand for a bodiless request without headers
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path, HashMap::new(), None)
    }

    /// Create from hyper request with body size limit
    ///
    /// # Errors
    ///
    /// Returns `Error::PayloadTooLarge` when the declared or received body
    /// exceeds `max_body_size`, and `Error::RouteNotFound` for methods the
    /// router cannot serve (`TRACE`, `CONNECT`, extensions).
    pub async fn from_hyper_with_limit(
        req: HyperRequest<hyper::body::Incoming>,
        max_body_size: usize,
    ) -> Result<Self> {
        let uri = req.uri();
        let method = Method::from_hyper(req.method()).ok_or_else(|| Error::RouteNotFound {
            method: req.method().to_string(),
            path: uri.path().to_string(),
        })?;

        let path = uri.path().to_string();
        let query_string = uri.query().map(String::from);
        let query_params = parse_query_string(query_string.as_deref());

        let headers = req.headers().clone();
        let declared = headers
            .get(hyper::header::CONTENT_LENGTH)
            .and_then(|len| len.to_str().ok())
            .and_then(|len| len.parse::<usize>().ok());
        if let Some(content_len) = declared {
            if content_len > max_body_size {
                return Err(Error::PayloadTooLarge {
                    limit: max_body_size,
                    actual: content_len,
                });
            }
        }

        let body = match BodyExt::collect(req.into_body()).await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                if bytes.len() > max_body_size {
                    return Err(Error::PayloadTooLarge {
                        limit: max_body_size,
                        actual: bytes.len(),
                    });
                }
                Some(bytes)
            }
            Err(_) => None,
        };

        Ok(Self {
            method,
            path,
            query_string,
            query_params,
            headers,
            body,
            attributes: HashMap::new(),
            params: Params::new(),
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
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            hyper::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(n, v);
        }
    }

    /// Get all headers as a HashMap
    #[must_use]
    pub fn headers_map(&self) -> HashMap<String, String> {
        self.headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect()
    }

    /// Content type without parameters, lowercased
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    /// Whether the client prefers a JSON response
    #[must_use]
    pub fn wants_json(&self) -> bool {
        self.header("accept")
            .is_some_and(|accept| accept.contains("application/json") || accept.contains("+json"))
    }

    /// Get query parameters as a HashMap
    #[must_use]
    pub const fn query_map(&self) -> &HashMap<String, String> {
        &self.query_params
    }

    /// Single query parameter
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(String::as_str)
    }

    /// Get raw query string
    #[must_use]
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// Get the request body as bytes
    #[must_use]
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// Get the request body as string (UTF-8)
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        self.body_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Parse the body according to the `Content-Type` header
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` (via the JSON parser) for malformed JSON bodies.
    pub fn parsed_body(&self) -> Result<ParsedBody> {
        let Some(body) = self.body.as_ref().filter(|b| !b.is_empty()) else {
            return Ok(ParsedBody::Empty);
        };

        match self.content_type().as_deref() {
            Some(ct) if ct == "application/json" || ct.ends_with("+json") => {
                let mut bytes = body.to_vec();
                Ok(ParsedBody::Json(parse_json_bytes(&mut bytes)?))
            }
            Some("application/x-www-form-urlencoded") => {
                let text = String::from_utf8_lossy(body);
                Ok(ParsedBody::Form(parse_query_string(Some(&text))))
            }
            Some(ct) if ct.ends_with("/xml") || ct.ends_with("+xml") => {
                Ok(ParsedBody::Xml(String::from_utf8_lossy(body).into_owned()))
            }
            Some("multipart/form-data") => {
                let (fields, _) = self.multipart()?;
                Ok(ParsedBody::Multipart(fields))
            }
            _ => Ok(ParsedBody::Raw(body.clone())),
        }
    }

    /// Look up an input value from the body (form/multipart/JSON) or query string
    #[must_use]
    pub fn input(&self, name: &str) -> Option<String> {
        let from_body = match self.parsed_body().ok()? {
            ParsedBody::Form(map) | ParsedBody::Multipart(map) => map.get(name).cloned(),
            ParsedBody::Json(Value::Object(map)) => map.get(name).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        };
        from_body.or_else(|| self.query(name).map(String::from))
    }

    /// Files uploaded in a `multipart/form-data` body
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` when the multipart boundary is missing.
    pub fn files(&self) -> Result<Vec<UploadedFile>> {
        if self.content_type().as_deref() != Some("multipart/form-data") {
            return Ok(Vec::new());
        }
        Ok(self.multipart()?.1)
    }

    /// First uploaded file for a form field
    #[must_use]
    pub fn file(&self, field: &str) -> Option<UploadedFile> {
        self.files().ok()?.into_iter().find(|f| f.field == field)
    }

    fn multipart(&self) -> Result<(HashMap<String, String>, Vec<UploadedFile>)> {
        let boundary = self
            .header("content-type")
            .and_then(|ct| {
                ct.split(';')
                    .map(str::trim)
                    .find_map(|p| p.strip_prefix("boundary="))
            })
            .map(|b| b.trim_matches('"').to_string())
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "multipart body without boundary",
                ))
            })?;
        let body = self.body.clone().unwrap_or_default();
        Ok(parse_multipart(&body, &boundary))
    }

    /// Store a per-request attribute
    pub fn set_attribute(&mut self, key: impl Into<String>, value: Value) {
        self.attributes.insert(key.into(), value);
    }

    /// Read a per-request attribute
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Path parameters of the matched route
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// Cookie value from the `Cookie` header
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.header("cookie")?.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| url_decode(v))
        })
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a multipart body into text fields and files
fn parse_multipart(body: &Bytes, boundary: &str) -> (HashMap<String, String>, Vec<UploadedFile>) {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut fields = HashMap::new();
    let mut files = Vec::new();

    let mut rest: &[u8] = body;
    while let Some(start) = find_subslice(rest, delimiter) {
        rest = &rest[start + delimiter.len()..];
        if rest.starts_with(b"--") {
            break;
        }
        let Some(end) = find_subslice(rest, delimiter) else {
            break;
        };
        let part = rest[..end]
            .strip_prefix(b"\r\n")
            .unwrap_or(&rest[..end]);
        let part = part.strip_suffix(b"\r\n").unwrap_or(part);

        let Some(split) = find_subslice(part, b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&part[..split]);
        let data = &part[split + 4..];

        let mut name = None;
        let mut filename = None;
        let mut content_type = None;
        for line in head.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for attr in value.split(';').map(str::trim) {
                    if let Some(v) = attr.strip_prefix("name=") {
                        name = Some(v.trim_matches('"').to_string());
                    } else if let Some(v) = attr.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.trim().to_string());
            }
        }

        let Some(field) = name else { continue };
        match filename {
            Some(filename) => files.push(UploadedFile {
                field,
                filename,
                content_type,
                data: body.slice_ref(data),
            }),
            None => {
                fields.insert(field, String::from_utf8_lossy(data).into_owned());
            }
        }
    }

    (fields, files)
}

/// Parse query string into HashMap
///
/// Handles URL decoding and duplicate keys (last value wins).
pub(crate) fn parse_query_string(query: Option<&str>) -> HashMap<String, String> {
    query
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .filter_map(|pair| {
                    let mut parts = pair.splitn(2, '=');
                    let key = parts.next()?;
                    let value = parts.next().unwrap_or("");
                    Some((url_decode(key), url_decode(value)))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Percent-decoding for query strings and form bodies
pub(crate) fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                out.push((hex_value(bytes[i + 1]) << 4) | hex_value(bytes[i + 2]));
                i += 2;
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

const fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}
