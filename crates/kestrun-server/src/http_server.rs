//! HTTP Server for the Kestrun host
//!
//! Serves HTTP/1.1 with hyper on tokio. Each accepted connection gets its
//! own task; each request is read into a [`RequestModel`], run through
//! [`KestrunHost::handle`] and rendered back.
//!
//! # Architecture
//!
//! The server:
//! - Listens on a TCP socket for incoming HTTP connections
//! - Spawns a tokio task for each connection
//! - Buffers request bodies up to `max_body_bytes` (413 beyond that)
//! - Cancels a request's token when the client goes away
//! - Stops accepting and drains connections when the shutdown token fires
//!
//! # Example
//!
//! ```no_run
//! use kestrun_server::{HostConfig, HttpServer, KestrunHost};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut host = KestrunHost::new(HostConfig::default()).unwrap();
//!     host.start().await.unwrap();
//!     let server = HttpServer::new(Arc::new(host));
//!     server.run("127.0.0.1:5000".parse().unwrap(), CancellationToken::new()).await.unwrap();
//! }
//! ```

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use kestrun_common::transport::{HttpTransport, HyperRequest, HyperResponse};
use kestrun_common::{KestrunError, Result};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::host::KestrunHost;

/// HTTP front end for a started [`KestrunHost`].
pub struct HttpServer {
    host: Arc<KestrunHost>,
}

impl HttpServer {
    pub fn new(host: Arc<KestrunHost>) -> Self {
        Self { host }
    }

    /// Binds `addr` and serves until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// `Transport` if the address cannot be bound.
    pub async fn run(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KestrunError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serves connections from an already bound listener until `shutdown`
    /// is cancelled, then waits for open connections to finish.
    ///
    /// # Errors
    ///
    /// `Transport` if the listener's local address cannot be read.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| KestrunError::Transport(format!("Failed to get local address: {}", e)))?;
        tracing::info!("HTTP server listening on {}", local_addr);

        let connections = tokio_util::task::TaskTracker::new();
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let host = Arc::clone(&self.host);
            let shutdown = shutdown.clone();
            connections.spawn(Self::serve_connection(host, stream, remote_addr, shutdown));
        }

        connections.close();
        tracing::info!(open = connections.len(), "HTTP server draining connections");
        connections.wait().await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    async fn serve_connection(
        host: Arc<KestrunHost>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let options = host.config().server.clone();
        let max_body_bytes = options.max_body_bytes;
        let service = service_fn(move |req: HyperRequest| {
            let host = Arc::clone(&host);
            async move { Ok::<_, Infallible>(Self::handle_request(host, req, remote_addr, max_body_bytes).await) }
        });

        let connection = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(options.header_read_timeout)
            .keep_alive(options.keep_alive)
            .serve_connection(TokioIo::new(stream), service);
        tokio::pin!(connection);

        let mut draining = false;
        let result = loop {
            tokio::select! {
                result = connection.as_mut() => break result,
                _ = shutdown.cancelled(), if !draining => {
                    connection.as_mut().graceful_shutdown();
                    draining = true;
                }
            }
        };

        if let Err(e) = result {
            tracing::debug!(%remote_addr, "Connection closed with error: {}", e);
        }
    }

    /// Handles an HTTP request.
    ///
    /// The request's cancellation token fires if hyper drops this future,
    /// which happens when the client disconnects mid-request.
    async fn handle_request(
        host: Arc<KestrunHost>,
        req: HyperRequest,
        remote_addr: SocketAddr,
        max_body_bytes: usize,
    ) -> HyperResponse {
        let cancellation = CancellationToken::new();
        let _guard = cancellation.clone().drop_guard();

        let request = match HttpTransport::read_request(req, Some(remote_addr), max_body_bytes).await {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(%remote_addr, "Rejected request: {}", e);
                return HttpTransport::error_response(e.status_code());
            }
        };

        let response = host.handle(request, cancellation.clone()).await;
        HttpTransport::to_http_response(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::host::RouteOptions;
    use crate::languages::HandlerSource;
    use crate::runtime::PoolConfig;
    use std::time::Duration;

    async fn start(host: KestrunHost) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = HttpServer::new(Arc::new(host));
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));
        (addr, shutdown, handle)
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let mut host = KestrunHost::new(HostConfig {
            pool: PoolConfig::new(1, 1),
            ..HostConfig::default()
        })
        .unwrap();
        host.map_route(RouteOptions::new("/ping", HandlerSource::javascript("Response.writeText('pong');")))
            .unwrap();
        host.start().await.unwrap();

        let (addr, shutdown, handle) = start(host).await;
        let body = reqwest::get(format!("http://{}/ping", addr)).await.unwrap().text().await.unwrap();
        assert_eq!(body, "pong");

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let mut config = HostConfig::default();
        config.pool = PoolConfig::new(0, 1);
        config.server.max_body_bytes = 16;
        let mut host = KestrunHost::new(config).unwrap();
        host.map_route(
            RouteOptions::new("/upload", HandlerSource::rhai("Response.write_text(Request.Body);")).methods(["POST"]),
        )
        .unwrap();
        host.start().await.unwrap();

        let (addr, shutdown, _handle) = start(host).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/upload", addr))
            .body("x".repeat(64))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 413);

        let response = client
            .post(format!("http://{}/upload", addr))
            .body("small")
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "small");
        shutdown.cancel();
    }
}
