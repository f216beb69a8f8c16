//! # Router
//!
//! Ordered route table with group scoping, named-route URL generation and
//! request dispatch through the middleware chain.
//!
//! ## Matching
//!
//! Routes are tried in registration order and the first one whose method and
//! pattern match wins, so `/users/{id}` registered before `/users/new` also
//! captures `/users/new`.
//!
//! ## Middleware order
//!
//! The chain for a route is `global ++ groups (outer first) ++ route`. With
//! [`MiddlewareOrder::Reversed`] (the default) that list runs back to front;
//! [`MiddlewareOrder::Declared`] runs it as written.
//!
//! The table is built single-threaded at startup and shared read-only
//! (`Arc<Router>`) by the server once serving starts.

use crate::error::{Error, Result};
use crate::errors_page::{ErrorPages, ErrorRenderer};
use crate::handler::{Handler, HandlerRef, HandlerRegistry};
use crate::middleware::{Middleware, MiddlewareChain, MiddlewareRegistry};
use crate::request::Request;
use crate::response::Response;
use crate::route::{normalize_path, PathPattern, Route};
use crate::types::Params;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// HTTP methods supported by the router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
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

impl Method {
    /// Convert from hyper's method type
    ///
    /// Returns `None` for methods without a route verb.
    #[must_use]
    pub fn from_hyper(method: &hyper::Method) -> Option<Self> {
        match *method {
            hyper::Method::GET => Some(Self::Get),
            hyper::Method::POST => Some(Self::Post),
            hyper::Method::PUT => Some(Self::Put),
            hyper::Method::DELETE => Some(Self::Delete),
            hyper::Method::PATCH => Some(Self::Patch),
            hyper::Method::HEAD => Some(Self::Head),
            hyper::Method::OPTIONS => Some(Self::Options),
            _ => None,
        }
    }
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

impl std::str::FromStr for Method {
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
            other => Err(Error::Config {
                message: format!("unsupported HTTP method '{other}'"),
            }),
        }
    }
}

/// Execution order of the assembled middleware list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MiddlewareOrder {
    /// Route middleware first, global middleware last
    #[default]
    Reversed,
    /// Global middleware first, route middleware last
    Declared,
}

/// Prefix and middleware applied to every route registered inside a group
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    prefix: String,
    middleware: Vec<String>,
}

impl GroupConfig {
    /// Empty group (no prefix, no middleware)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Path prefix, concatenated onto enclosing prefixes
    #[must_use]
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Middleware names applied to the group's routes
    #[must_use]
    pub fn middleware<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.middleware.extend(names.into_iter().map(Into::into));
        self
    }
}

/// Matched route with extracted parameters
#[derive(Debug)]
pub struct RouteMatch<'a> {
    /// The route that matched
    pub route: &'a Route,
    /// Captured path parameters
    pub params: Params,
}

/// Handle on the routes created by one registration call
///
/// Used to attach a name or route-level middleware.
pub struct RouteHandle<'r> {
    router: &'r mut Router,
    indices: Vec<usize>,
}

impl RouteHandle<'_> {
    /// Name the route(s), replacing any earlier name given through this handle
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateRouteName` if another route already uses the name.
    pub fn name(self, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if let Some(existing) = self.router.names.get(&name) {
            if !self.indices.contains(existing) {
                return Err(Error::DuplicateRouteName { name });
            }
        }

        for &i in &self.indices {
            if let Some(old) = self.router.routes[i].name.take() {
                self.router.names.remove(&old);
            }
            self.router.routes[i].name = Some(name.clone());
        }
        if let Some(&first) = self.indices.first() {
            self.router.names.insert(name, first);
        }
        Ok(self)
    }

    /// Append route-level middleware by name
    ///
    /// # Errors
    ///
    /// Returns `Error::MiddlewareNotRegistered` for unknown names.
    pub fn middleware<I, S>(self, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            let resolved = self.router.middleware.resolve(&name)?;
            for &i in &self.indices {
                let route = &mut self.router.routes[i];
                route.middleware.push(name.clone());
                route.resolved_middleware.push((name.clone(), resolved.clone()));
            }
        }
        Ok(self)
    }

    /// Routes created by this registration
    #[must_use]
    pub fn routes(&self) -> Vec<&Route> {
        self.indices.iter().map(|&i| &self.router.routes[i]).collect()
    }
}

/// Restores group state when a group body ends, including by panic
struct GroupScope<'r> {
    router: &'r mut Router,
    prefixes: usize,
    middleware: usize,
}

impl Deref for GroupScope<'_> {
    type Target = Router;

    fn deref(&self) -> &Router {
        self.router
    }
}

impl DerefMut for GroupScope<'_> {
    fn deref_mut(&mut self) -> &mut Router {
        self.router
    }
}

impl Drop for GroupScope<'_> {
    fn drop(&mut self) {
        self.router.prefix_stack.truncate(self.prefixes);
        self.router.group_middleware.truncate(self.middleware);
    }
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{millis:x}-{seq:04x}")
}

/// HTTP router
pub struct Router {
    routes: Vec<Route>,
    names: HashMap<String, usize>,
    middleware: MiddlewareRegistry,
    handlers: HandlerRegistry,
    global: Vec<(String, Arc<dyn Middleware>)>,
    prefix_stack: Vec<String>,
    group_middleware: Vec<String>,
    order: MiddlewareOrder,
    renderer: Arc<dyn ErrorRenderer>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new empty router
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            names: HashMap::new(),
            middleware: MiddlewareRegistry::new(),
            handlers: HandlerRegistry::new(),
            global: Vec::new(),
            prefix_stack: Vec::new(),
            group_middleware: Vec::new(),
            order: MiddlewareOrder::default(),
            renderer: Arc::new(ErrorPages::new()),
        }
    }

    /// Register a middleware under a name
    pub fn register_middleware<M: Middleware + 'static>(&mut self, name: impl Into<String>, middleware: M) {
        self.middleware.register(name, middleware);
    }

    /// Register a handler under a name (e.g. `users.show`)
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Handler) {
        self.handlers.register(name, handler);
    }

    /// Add a registered middleware to every route
    ///
    /// # Errors
    ///
    /// Returns `Error::MiddlewareNotRegistered` for unknown names.
    pub fn use_middleware(&mut self, name: &str) -> Result<()> {
        let resolved = self.middleware.resolve(name)?;
        self.global.push((name.to_string(), resolved));
        Ok(())
    }

    /// Choose the execution order of assembled middleware
    pub fn set_middleware_order(&mut self, order: MiddlewareOrder) {
        self.order = order;
    }

    /// Replace the not-found / error renderer
    pub fn set_error_renderer(&mut self, renderer: Arc<dyn ErrorRenderer>) {
        self.renderer = renderer;
    }

    /// Render `err` for `request` with the configured error renderer
    pub fn render_error(&self, request: &Request, err: &Error) -> Response {
        self.renderer.error(request, err)
    }

    /// Register a route for several methods at once
    ///
    /// The created routes share one name when named through the handle.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRoutePattern`, `Error::HandlerNotRegistered` or
    /// `Error::MiddlewareNotRegistered` (for group middleware).
    pub fn match_methods(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: impl Into<HandlerRef>,
    ) -> Result<RouteHandle<'_>> {
        let full_path = format!("{}/{}", self.prefix_stack.concat(), path);
        let pattern = PathPattern::compile(&full_path)?;
        let (handler_name, handler) = self.handlers.resolve(handler.into())?;
        let mut resolved = Vec::with_capacity(self.group_middleware.len());
        for name in &self.group_middleware {
            resolved.push((name.clone(), self.middleware.resolve(name)?));
        }

        let mut indices = Vec::with_capacity(methods.len());
        for &method in methods {
            debug!(method = %method, path = %pattern.as_str(), handler = %handler_name, "Route registered");
            indices.push(self.routes.len());
            self.routes.push(Route {
                method,
                pattern: pattern.clone(),
                name: None,
                middleware: self.group_middleware.clone(),
                handler_name: handler_name.clone(),
                resolved_middleware: resolved.clone(),
                handler: handler.clone(),
            });
        }

        Ok(RouteHandle {
            router: self,
            indices,
        })
    }

    /// Register a GET route
    ///
    /// # Errors
    ///
    /// See [`Router::match_methods`].
    pub fn get(&mut self, path: &str, handler: impl Into<HandlerRef>) -> Result<RouteHandle<'_>> {
        self.match_methods(&[Method::Get], path, handler)
    }

    /// Register a POST route
    ///
    /// # Errors
    ///
    /// See [`Router::match_methods`].
    pub fn post(&mut self, path: &str, handler: impl Into<HandlerRef>) -> Result<RouteHandle<'_>> {
        self.match_methods(&[Method::Post], path, handler)
    }

    /// Register a PUT route
    ///
    /// # Errors
    ///
    /// See [`Router::match_methods`].
    pub fn put(&mut self, path: &str, handler: impl Into<HandlerRef>) -> Result<RouteHandle<'_>> {
        self.match_methods(&[Method::Put], path, handler)
    }

    /// Register a PATCH route
    ///
    /// # Errors
    ///
    /// See [`Router::match_methods`].
    pub fn patch(&mut self, path: &str, handler: impl Into<HandlerRef>) -> Result<RouteHandle<'_>> {
        self.match_methods(&[Method::Patch], path, handler)
    }

    /// Register a DELETE route
    ///
    /// # Errors
    ///
    /// See [`Router::match_methods`].
    pub fn delete(&mut self, path: &str, handler: impl Into<HandlerRef>) -> Result<RouteHandle<'_>> {
        self.match_methods(&[Method::Delete], path, handler)
    }

    /// Register an OPTIONS route
    ///
    /// # Errors
    ///
    /// See [`Router::match_methods`].
    pub fn options(&mut self, path: &str, handler: impl Into<HandlerRef>) -> Result<RouteHandle<'_>> {
        self.match_methods(&[Method::Options], path, handler)
    }

    /// Register routes inside a prefix / middleware scope
    ///
    /// Group state is restored when `body` returns, fails or panics.
    ///
    /// # Errors
    ///
    /// Returns `Error::MiddlewareNotRegistered` for unknown group middleware,
    /// or whatever `body` returns.
    pub fn group<F>(&mut self, config: GroupConfig, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        for name in &config.middleware {
            self.middleware.resolve(name)?;
        }

        let mut scope = GroupScope {
            prefixes: self.prefix_stack.len(),
            middleware: self.group_middleware.len(),
            router: self,
        };
        let prefix = config.prefix.trim_end_matches('/');
        if !prefix.is_empty() {
            scope.prefix_stack.push(format!("/{}", prefix.trim_start_matches('/')));
        }
        scope.group_middleware.extend(config.middleware);
        body(&mut *scope)
    }

    /// Generate the URL of a named route
    ///
    /// Returns `Ok(None)` when no route has this name.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingRouteParameter` when a required placeholder has
    /// no value.
    pub fn route(&self, name: &str, params: &HashMap<String, String>) -> Result<Option<String>> {
        let Some(&index) = self.names.get(name) else {
            return Ok(None);
        };
        self.routes[index].pattern.render(name, params).map(Some)
    }

    /// Registered routes in registration order
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Drop every route and name; registries and global middleware stay
    pub fn clear_routes(&mut self) {
        self.routes.clear();
        self.names.clear();
    }

    /// Find the first route matching a method and path
    ///
    /// # Errors
    ///
    /// Returns `Error::RouteNotFound` if no route matches.
    pub fn match_route(&self, method: Method, path: &str) -> Result<RouteMatch<'_>> {
        let path = normalize_path(path);
        self.routes
            .iter()
            .filter(|route| route.method == method)
            .find_map(|route| {
                route
                    .pattern
                    .captures(&path)
                    .map(|params| RouteMatch { route, params })
            })
            .ok_or_else(|| Error::RouteNotFound {
                method: method.to_string(),
                path,
            })
    }

    /// Middleware for a route in execution order
    fn chain_for(&self, route: &Route) -> MiddlewareChain {
        let mut chain: MiddlewareChain = self
            .global
            .iter()
            .chain(&route.resolved_middleware)
            .cloned()
            .collect();
        if self.order == MiddlewareOrder::Reversed {
            chain.reverse();
        }
        chain
    }

    /// Route a request and run its middleware and handler
    ///
    /// Unmatched requests produce the renderer's not-found response.
    ///
    /// # Errors
    ///
    /// Returns the handler's error.
    pub async fn dispatch(&self, mut request: Request) -> Result<Response> {
        let matched = match self.match_route(request.method, &request.path) {
            Ok(matched) => matched,
            Err(_) => {
                debug!(method = %request.method, path = %request.path, "No route matched");
                return Ok(self.renderer.not_found(&request));
            }
        };

        let RouteMatch { route, params } = matched;
        debug!(
            method = %request.method,
            path = %request.path,
            route = %route.pattern.as_str(),
            "Route matched"
        );
        request.set_params(params.clone());

        let mut response = Response::new();
        if !self.chain_for(route).run(&mut request, &mut response, &params) {
            return Ok(response);
        }
        (route.handler)(request, response, params).await
    }

    /// Dispatch with an optional deadline, rendering any failure
    ///
    /// Every response carries an `X-Request-Id` header, taken from the
    /// request when present.
    pub async fn handle(&self, mut request: Request, deadline: Option<Duration>) -> Response {
        let request_id = match request.header("x-request-id") {
            Some(id) => id.to_string(),
            None => {
                let id = next_request_id();
                request.set_header("x-request-id", &id);
                id
            }
        };
        let context = Request::new(
            request.method,
            request.path.clone(),
            request.headers_map(),
            None,
        );

        let outcome = match deadline {
            Some(limit) => tokio::time::timeout(limit, self.dispatch(request))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Timeout {
                        millis: limit.as_millis(),
                    })
                }),
            None => self.dispatch(request).await,
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => {
                if matches!(err, Error::Timeout { .. }) {
                    warn!(request_id = %request_id, path = %context.path, "Request timed out");
                } else {
                    error!(request_id = %request_id, path = %context.path, error = %err, "Handler failed");
                }
                self.renderer.error(&context, &err)
            }
        };
        response.insert_header("X-Request-Id", &request_id);
        response
    }
}
