//! # Route Handlers
//!
//! A handler receives the request, the response prepared by the middleware
//! chain, and the matched path parameters, and returns the final response.
//!
//! Handlers are attached to routes either directly or by name through a
//! [`HandlerRegistry`]; names are resolved when the route is registered so an
//! unknown name fails at startup rather than on the first request.

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::types::Params;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed handler future
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

/// Handler function type (async)
pub type Handler = Arc<dyn Fn(Request, Response, Params) -> HandlerFuture + Send + Sync>;

/// Wrap an async function or closure into a [`Handler`]
///
/// ```ignore
/// router.get("/users/{id}", handler(|_req, mut res, params| async move {
///     res.json(&serde_json::json!({ "id": params.get("id") }))?;
///     Ok(res)
/// }))?;
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request, Response, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |req, res, params| Box::pin(f(req, res, params)))
}

/// Reference to a handler at registration time
#[derive(Clone)]
pub enum HandlerRef {
    /// Handler given inline
    Direct(Handler),
    /// Registry key such as `users.show`
    Named(String),
}

impl From<Handler> for HandlerRef {
    fn from(handler: Handler) -> Self {
        Self::Direct(handler)
    }
}

impl From<&str> for HandlerRef {
    fn from(name: &str) -> Self {
        Self::Named(name.to_string())
    }
}

impl From<String> for HandlerRef {
    fn from(name: String) -> Self {
        Self::Named(name)
    }
}

/// Name → handler table
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, handler: Handler) {
        self.handlers.insert(name.into(), handler);
    }

    /// Whether a name is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Resolve a reference into a display label and the handler
    ///
    /// # Errors
    ///
    /// Returns `Error::HandlerNotRegistered` for unknown names.
    pub fn resolve(&self, reference: HandlerRef) -> Result<(String, Handler)> {
        match reference {
            HandlerRef::Direct(handler) => Ok(("closure".to_string(), handler)),
            HandlerRef::Named(name) => {
                let handler = self
                    .handlers
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| Error::HandlerNotRegistered { name: name.clone() })?;
                Ok((name, handler))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Handler {
        handler(|_req, mut res, _params| async move {
            res.text("hello");
            Ok(res)
        })
    }

    #[test]
    fn test_resolve_direct() {
        let registry = HandlerRegistry::new();
        let (label, _) = registry.resolve(hello().into()).unwrap();
        assert_eq!(label, "closure");
    }

    #[test]
    fn test_resolve_named() {
        let mut registry = HandlerRegistry::new();
        registry.register("home.index", hello());
        assert!(registry.contains("home.index"));

        let (label, h) = registry.resolve("home.index".into()).unwrap();
        assert_eq!(label, "home.index");

        let res = tokio_test::block_on(h(Request::get("/"), Response::new(), Params::new())).unwrap();
        assert_eq!(res.body_text(), "hello");
    }

    #[test]
    fn test_resolve_unknown_name() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve("missing".into()).err().unwrap();
        assert!(matches!(err, Error::HandlerNotRegistered { ref name } if name == "missing"));
    }
}
