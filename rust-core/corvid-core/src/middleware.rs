//! # Middleware System
//!
//! Pre-handler interception: logging, CORS, rate limiting, JWT, auth, CSRF.
//!
//! A middleware inspects or modifies the request and response and returns
//! `true` to continue or `false` to halt. When a middleware halts, neither the
//! remaining middleware nor the handler runs and the response it wrote is the
//! final response.
//!
//! Routes refer to middleware by name. Names are resolved against a
//! [`MiddlewareRegistry`] when the route is registered.

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::{Cookie, Response};
use crate::router::Method;
use crate::types::Params;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::json;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Middleware trait for request interception
pub trait Middleware: Send + Sync {
    /// Inspect the request; return `false` to halt the chain
    fn handle(&self, req: &mut Request, res: &mut Response, params: &Params) -> bool;

    /// Middleware name for logging
    fn name(&self) -> &'static str {
        "Unknown"
    }
}

/// Name → middleware table
#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    entries: HashMap<String, Arc<dyn Middleware>>,
}

impl MiddlewareRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware under a name, replacing any previous entry
    pub fn register<M: Middleware + 'static>(&mut self, name: impl Into<String>, middleware: M) {
        self.entries.insert(name.into(), Arc::new(middleware));
    }

    /// Resolve a name
    ///
    /// # Errors
    ///
    /// Returns `Error::MiddlewareNotRegistered` for unknown names.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Middleware>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MiddlewareNotRegistered {
                name: name.to_string(),
            })
    }

    /// Whether a name is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

/// Ordered middleware list executed for one request
#[derive(Default, Clone)]
pub struct MiddlewareChain {
    middlewares: Vec<(String, Arc<dyn Middleware>)>,
}

impl MiddlewareChain {
    /// Create a new empty middleware chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named middleware
    pub fn push(&mut self, name: impl Into<String>, middleware: Arc<dyn Middleware>) {
        self.middlewares.push((name.into(), middleware));
    }

    /// Reverse execution order in place
    pub fn reverse(&mut self) {
        self.middlewares.reverse();
    }

    /// Names in execution order
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run every middleware in order, stopping at the first `false`
    ///
    /// Returns whether the handler should run.
    pub fn run(&self, req: &mut Request, res: &mut Response, params: &Params) -> bool {
        for (name, mw) in &self.middlewares {
            if !mw.handle(req, res, params) {
                debug!(
                    middleware = %name,
                    kind = mw.name(),
                    status = res.status,
                    "Middleware halted request"
                );
                return false;
            }
        }
        true
    }

    /// Get the number of middlewares
    #[must_use]
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if chain is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

impl FromIterator<(String, Arc<dyn Middleware>)> for MiddlewareChain {
    fn from_iter<I: IntoIterator<Item = (String, Arc<dyn Middleware>)>>(iter: I) -> Self {
        Self {
            middlewares: iter.into_iter().collect(),
        }
    }
}

fn deny(res: &mut Response, status: u16, message: &str) -> bool {
    res.set_status(status);
    // serializing a json! literal cannot fail
    let _ = res.json(&json!({ "error": message }));
    false
}

/// Logging middleware - logs requests in structured form
#[derive(Default)]
pub struct LoggingMiddleware {
    log_headers: bool,
}

impl LoggingMiddleware {
    /// Create a new logging middleware
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable header logging
    #[must_use]
    pub const fn with_headers(mut self) -> Self {
        self.log_headers = true;
        self
    }
}

impl Middleware for LoggingMiddleware {
    fn handle(&self, req: &mut Request, _res: &mut Response, _params: &Params) -> bool {
        let request_id = req.header("x-request-id").unwrap_or("-");
        if self.log_headers {
            info!(
                method = %req.method,
                path = %req.path,
                request_id = %request_id,
                headers = ?req.headers_map(),
                "Request received"
            );
        } else {
            info!(
                method = %req.method,
                path = %req.path,
                request_id = %request_id,
                "Request received"
            );
        }
        true
    }

    fn name(&self) -> &'static str {
        "LoggingMiddleware"
    }
}

/// CORS middleware - adds Cross-Origin Resource Sharing headers
///
/// Preflight (`OPTIONS`) requests are answered with 204 and halt the chain.
#[derive(Clone)]
pub struct CorsMiddleware {
    allow_origin: String,
    allow_methods: String,
    allow_headers: String,
}

impl Default for CorsMiddleware {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, PATCH, OPTIONS".to_string(),
            allow_headers: "Content-Type, Authorization, X-CSRF-TOKEN".to_string(),
        }
    }
}

impl CorsMiddleware {
    /// Create a new CORS middleware with default settings
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set allowed origin
    #[must_use]
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allow_origin = origin.into();
        self
    }

    /// Set allowed methods
    #[must_use]
    pub fn allow_methods(mut self, methods: impl Into<String>) -> Self {
        self.allow_methods = methods.into();
        self
    }

    /// Set allowed headers
    #[must_use]
    pub fn allow_headers(mut self, headers: impl Into<String>) -> Self {
        self.allow_headers = headers.into();
        self
    }

    /// Get the Access-Control-Allow-Origin header value
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.allow_origin
    }
}

impl Middleware for CorsMiddleware {
    fn handle(&self, req: &mut Request, res: &mut Response, _params: &Params) -> bool {
        res.set_header("Access-Control-Allow-Origin", &self.allow_origin);
        res.set_header("Access-Control-Allow-Methods", &self.allow_methods);
        res.set_header("Access-Control-Allow-Headers", &self.allow_headers);
        if req.method == Method::Options {
            res.set_status(204);
            return false;
        }
        true
    }

    fn name(&self) -> &'static str {
        "CorsMiddleware"
    }
}

/// Token bucket rate limiting middleware
pub struct RateLimitMiddleware {
    /// Maximum burst capacity
    capacity: u64,
    /// Tokens refilled per second
    refill_per_sec: u64,
    /// Bucket count that triggers a sweep of refilled buckets
    max_clients: usize,
    /// Per-key buckets
    state: Mutex<HashMap<String, Bucket>>,
}

/// Internal token bucket state
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

impl RateLimitMiddleware {
    /// Create a new rate limiter
    #[must_use]
    pub fn new(capacity: u64, refill_per_sec: u64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            max_clients: 10_000,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Tracked client count above which full buckets are dropped
    #[must_use]
    pub fn max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn refilled(&self, bucket: &Bucket, now: Instant) -> u64 {
        let elapsed = now.duration_since(bucket.last_refill);
        (elapsed.as_secs_f64() * self.refill_per_sec as f64) as u64
    }

    fn allow(&self, key: &str) -> bool {
        let mut map = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        if map.len() >= self.max_clients && !map.contains_key(key) {
            // a full bucket holds no state worth keeping
            map.retain(|_, bucket| {
                bucket.tokens.saturating_add(self.refilled(bucket, now)) < self.capacity
            });
        }
        let bucket = map.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: now,
        });
        let refill = self.refilled(bucket, now);
        if refill > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refill).min(self.capacity);
            bucket.last_refill = now;
        }
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, req: &mut Request, res: &mut Response, _params: &Params) -> bool {
        let key = req.header("x-client-ip").unwrap_or("unknown").to_string();
        if self.allow(&key) {
            true
        } else {
            warn!(client = %key, "Rate limit exceeded");
            deny(res, 429, "Rate limit exceeded")
        }
    }

    fn name(&self) -> &'static str {
        "RateLimitMiddleware"
    }
}

/// JWT bearer-token middleware
///
/// Validates `Authorization: Bearer <token>` (HS256) and stores the decoded
/// claims in the `jwt` request attribute.
#[derive(Clone)]
pub struct JwtMiddleware {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtMiddleware {
    /// Create from shared secret
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Build from `[auth]` settings, `None` when no secret is configured
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Option<Self> {
        (!config.jwt_secret.is_empty()).then(|| Self::new(&config.jwt_secret))
    }
}

impl Middleware for JwtMiddleware {
    fn handle(&self, req: &mut Request, res: &mut Response, _params: &Params) -> bool {
        let Some(token) = req
            .header("authorization")
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string)
        else {
            return deny(res, 401, "Missing or invalid Authorization header");
        };

        match decode::<serde_json::Value>(&token, &self.decoding_key, &self.validation) {
            Ok(token_data) => {
                req.set_attribute("jwt", token_data.claims);
                true
            }
            Err(e) => {
                warn!("JWT validation failed: {}", e);
                deny(res, 401, "Unauthorized")
            }
        }
    }

    fn name(&self) -> &'static str {
        "JwtMiddleware"
    }
}

/// Authentication gate
///
/// Passes when an upstream middleware stored a `user` or `jwt` attribute.
/// Otherwise JSON clients get 401 and browsers are redirected to the login
/// path when one is configured.
#[derive(Clone, Default)]
pub struct AuthMiddleware {
    login_path: Option<String>,
}

impl AuthMiddleware {
    /// Create an auth gate answering 401
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect non-JSON clients to `path`
    #[must_use]
    pub fn redirect_to(mut self, path: impl Into<String>) -> Self {
        self.login_path = Some(path.into());
        self
    }
}

impl Middleware for AuthMiddleware {
    fn handle(&self, req: &mut Request, res: &mut Response, _params: &Params) -> bool {
        if req.attribute("user").is_some() || req.attribute("jwt").is_some() {
            return true;
        }
        match &self.login_path {
            Some(path) if !req.wants_json() => {
                res.redirect(path, None);
                false
            }
            _ => deny(res, 401, "Unauthenticated"),
        }
    }

    fn name(&self) -> &'static str {
        "AuthMiddleware"
    }
}

/// CSRF protection using the double-submit cookie pattern
///
/// Safe methods pass and receive a token cookie when none is present.
/// State-changing methods must echo the cookie value in the CSRF header or
/// the `_token` form field; a mismatch answers 419.
#[derive(Clone)]
pub struct CsrfMiddleware {
    cookie_name: String,
    header_name: String,
}

impl Default for CsrfMiddleware {
    fn default() -> Self {
        Self::new("XSRF-TOKEN", "X-CSRF-TOKEN")
    }
}

impl CsrfMiddleware {
    /// Create with custom cookie and header names
    #[must_use]
    pub fn new(cookie_name: impl Into<String>, header_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            header_name: header_name.into(),
        }
    }

    /// Build from `[auth]` settings
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.csrf_cookie, &config.csrf_header)
    }
}

impl Middleware for CsrfMiddleware {
    fn handle(&self, req: &mut Request, res: &mut Response, _params: &Params) -> bool {
        let expected = req.cookie(&self.cookie_name);
        if matches!(req.method, Method::Get | Method::Head | Method::Options) {
            if expected.is_none() {
                res.cookie(Cookie::new(&self.cookie_name, generate_token()).same_site("Lax"));
            }
            return true;
        }

        let supplied = req
            .header(&self.header_name)
            .map(str::to_string)
            .or_else(|| req.input("_token"));
        match (expected, supplied) {
            (Some(expected), Some(supplied)) if constant_time_eq(&expected, &supplied) => true,
            _ => {
                warn!(method = %req.method, path = %req.path, "CSRF token mismatch");
                deny(res, 419, "CSRF token mismatch")
            }
        }
    }

    fn name(&self) -> &'static str {
        "CsrfMiddleware"
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a
            .bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unpredictable hex token for CSRF cookies
///
/// Mixes a per-call `RandomState` (randomly keyed SipHash) with the clock and
/// a process counter.
#[must_use]
pub fn generate_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let counter = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    (0..2u8)
        .map(|lane| {
            let mut hasher = RandomState::new().build_hasher();
            (nanos, counter, lane).hash(&mut hasher);
            format!("{:016x}", hasher.finish())
        })
        .collect()
}
