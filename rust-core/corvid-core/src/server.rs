//! # HTTP Server
//!
//! HTTP/1 server built on Hyper and Tokio.
//! Implements graceful shutdown with signal handling.
//!
//! ## Key Features
//!
//! - The [`Router`] is frozen into an `Arc` and shared read-only by every
//!   connection task
//! - Optional per-request deadline around middleware and handler
//! - Graceful shutdown on CTRL+C with a bounded drain of open connections
//! - Request body size limit enforced before dispatch

use crate::config::{AppConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::errors_page::ErrorPages;
use crate::request::Request;
use crate::response::Response;
use crate::router::{Method, Router};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpSocket};
use tracing::{error, info};

/// HTTP server around a finished [`Router`]
pub struct Server {
    config: ServerConfig,
    router: Arc<Router>,
}

impl Server {
    /// Create a server with default settings
    ///
    /// The router can no longer be modified once handed over.
    #[must_use]
    pub fn new(router: Router) -> Self {
        Self {
            config: ServerConfig::default(),
            router: Arc::new(router),
        }
    }

    /// Create a server from application settings
    ///
    /// Error views are preloaded from `[views] error_dirs` when any are listed.
    #[must_use]
    pub fn from_config(mut router: Router, config: &AppConfig) -> Self {
        if !config.views.error_dirs.is_empty() {
            router.set_error_renderer(Arc::new(ErrorPages::from_dirs(&config.views.error_dirs)));
        }
        Self::new(router).with_config(config.server.clone())
    }

    /// Replace the server settings
    #[must_use]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind the server to an address
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.address = addr;
        self
    }

    /// Current settings
    #[must_use]
    pub const fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared route table
    #[must_use]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Open the listening socket
    ///
    /// # Errors
    ///
    /// Returns `Error::BindError` if the address cannot be bound.
    pub fn listen(&self) -> Result<TcpListener> {
        let addr = self.config.address;
        let bind_error = |source: std::io::Error| Error::BindError {
            address: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        socket.set_reuseaddr(true).map_err(bind_error)?;
        #[cfg(not(windows))]
        {
            socket.set_reuseport(true).map_err(bind_error)?;
        }
        socket.bind(addr).map_err(bind_error)?;
        socket.listen(1024).map_err(bind_error)
    }

    /// Start the server and run until CTRL+C
    ///
    /// # Errors
    ///
    /// Returns `Error::BindError` or an accept failure.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.listen()?;
        self.serve_with_shutdown(listener, shutdown_signal()).await
    }

    /// Accept connections on `listener` until `signal` completes
    ///
    /// Open connections get `shutdown_timeout` to finish afterwards.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if accepting a connection fails.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!("Server listening on http://{}", local);

        let active = Arc::new(AtomicUsize::new(0));
        let keep_alive = self.config.keep_alive;
        tokio::pin!(signal);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    let (stream, remote_addr) = accept_result?;
                    let io = TokioIo::new(stream);
                    let router = self.router.clone();
                    let config = self.config.clone();
                    let active = active.clone();

                    tokio::task::spawn(async move {
                        active.fetch_add(1, Ordering::Relaxed);

                        if let Err(err) = http1::Builder::new()
                            .keep_alive(keep_alive)
                            .serve_connection(io, service_fn(move |req| {
                                let router = router.clone();
                                let config = config.clone();
                                async move {
                                    Ok::<_, Infallible>(
                                        handle_request(req, &router, &config, remote_addr).await,
                                    )
                                }
                            }))
                            .await
                        {
                            error!("Error serving connection: {:?}", err);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                    });
                }
                () = &mut signal => {
                    info!("Shutdown signal received, stopping server...");
                    break;
                }
            }
        }

        let drain = async {
            while active.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(self.config.shutdown_timeout(), drain)
            .await
            .is_err()
        {
            info!(
                open = active.load(Ordering::Relaxed),
                "Shutdown timeout reached, dropping open connections"
            );
        }
        info!("Server stopped");
        Ok(())
    }

    /// Execute a request directly without the network stack
    pub async fn test_request(&self, mut request: Request) -> Response {
        if let Some(size) = request.body_bytes().map(<[u8]>::len) {
            if size > self.config.max_body_size {
                let err = Error::PayloadTooLarge {
                    limit: self.config.max_body_size,
                    actual: size,
                };
                return self.router.render_error(&request, &err);
            }
        }
        request.set_header("x-client-ip", "test");
        self.router
            .handle(request, self.config.request_timeout())
            .await
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to install CTRL+C signal handler: {}", err);
        std::future::pending::<()>().await;
    }
}

async fn handle_request(
    req: hyper::Request<hyper::body::Incoming>,
    router: &Router,
    config: &ServerConfig,
    remote_addr: SocketAddr,
) -> hyper::Response<Full<Bytes>> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let version = format!("{:?}", req.version());

    // enough of the request to render an error page if parsing fails
    let mut context_headers = HashMap::new();
    if let Some(accept) = req.headers().get(hyper::header::ACCEPT).and_then(|v| v.to_str().ok()) {
        context_headers.insert("accept".to_string(), accept.to_string());
    }
    let context = Request::new(
        Method::from_hyper(&method).unwrap_or(Method::Get),
        path.clone(),
        context_headers,
        None,
    );

    let response = match Request::from_hyper_with_limit(req, config.max_body_size).await {
        Ok(mut request) => {
            request.set_header("x-client-ip", &remote_addr.ip().to_string());
            router.handle(request, config.request_timeout()).await
        }
        Err(err) => {
            error!("Failed to parse request: {}", err);
            router.render_error(&context, &err)
        }
    };

    info!(
        remote = %remote_addr,
        status = response.status,
        elapsed_ms = started.elapsed().as_millis(),
        "\"{} {} {}\"",
        method,
        path,
        version
    );
    response.into_hyper()
}
