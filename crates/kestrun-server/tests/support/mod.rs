//! In-process test server
//!
//! Starts a [`KestrunHost`] behind an [`HttpServer`] on an ephemeral port
//! and cancels it when dropped.

use kestrun_server::{HttpServer, KestrunHost};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct TestServer {
    addr: SocketAddr,
    host: Arc<KestrunHost>,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Starts the host and serves it on `127.0.0.1:0`.
    pub async fn start(mut host: KestrunHost) -> Self {
        host.start().await.expect("Failed to start host");
        let host = Arc::new(host);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();

        let server = HttpServer::new(Arc::clone(&host));
        tokio::spawn(server.serve(listener, shutdown.clone()));

        Self { addr, host, shutdown }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn host(&self) -> &KestrunHost {
        &self.host
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
