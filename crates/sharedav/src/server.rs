//! HTTP server lifecycle management.
//!
//! [`HttpServer`] owns a listener and its accept loop; every connection is
//! served with hyper-util's auto (HTTP/1 + HTTP/2) builder. [`ShareServer`]
//! is the front endpoint that routes requests through
//! [`FileSystemForRemote::serve_http_with_perms`].

use crate::error::{BoxError, ServerError, ServerResult};
use crate::remote::FileSystemForRemote;
use crate::share::Permissions;
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// Listener configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind to (0 = auto-assign).
    pub port: u16,
    /// Bind address.
    pub bind_address: IpAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0, // Auto-assign
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl ServerConfig {
    /// Listen on `addr`.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            port: addr.port(),
            bind_address: addr.ip(),
        }
    }

    /// Socket address to bind.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// A running HTTP server.
pub struct HttpServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl HttpServer {
    /// Bind `config` and serve every request with `handler`.
    pub async fn start<F, Fut, B>(
        config: ServerConfig,
        name: &'static str,
        handler: F,
    ) -> ServerResult<Self>
    where
        F: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Response<B>> + Send + 'static,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let actual_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        info!(server = name, addr = %actual_addr, "Starting HTTP server");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, handler) => {
                    debug!(server = name, "Server loop ended");
                }
                _ = shutdown_rx => {
                    info!(server = name, "Received shutdown signal");
                }
            }
        });

        Ok(Self {
            addr: actual_addr,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Get the URL for this server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stop the server.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        debug!(addr = %self.addr, "HTTP server stopped");
    }

    fn stop_sync(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Run the server accept loop.
async fn run_server<F, Fut, B>(listener: TcpListener, handler: F)
where
    F: Fn(Request<Incoming>, SocketAddr) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<B>> + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let handler = handler.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req, peer_addr).await) }
                    });

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(peer = %peer_addr, error = %e, "HTTP connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Front endpoint serving shares to remote principals.
#[derive(Debug)]
pub struct ShareServer {
    http: HttpServer,
}

impl ShareServer {
    /// Start serving `remote` with a fixed permission policy for every
    /// peer.
    pub async fn start(
        remote: FileSystemForRemote,
        permissions: Arc<dyn Permissions>,
        config: ServerConfig,
    ) -> ServerResult<Self> {
        let handler = move |req: Request<Incoming>, peer: SocketAddr| {
            let remote = remote.clone();
            let permissions = Arc::clone(&permissions);
            async move {
                trace!(peer = %peer, method = %req.method(), path = %req.uri().path(), "Request");
                remote.serve_http_with_perms(permissions.as_ref(), req).await
            }
        };
        let http = HttpServer::start(config, "shares", handler).await?;
        Ok(Self { http })
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.http.addr
    }

    /// Get the URL for this server.
    pub fn url(&self) -> String {
        self.http.url()
    }

    /// Stop the server.
    pub async fn stop(self) {
        self.http.stop().await;
    }
}
