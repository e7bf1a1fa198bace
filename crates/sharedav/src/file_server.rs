//! WebDAV file server for a set of local shares.
//!
//! This is what runs inside a user server process: each share is served
//! under `/<name>/` by its own [`DavHandler`] over the local directory,
//! with an in-memory lock system per share.

use crate::backend::{full_body, ProxyBody};
use crate::error::{BoxError, ServerError, ServerResult};
use crate::router::clean_and_split;
use crate::server::{HttpServer, ServerConfig};
use dav_server::localfs::LocalFs;
use dav_server::memls::MemLs;
use dav_server::DavHandler;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Build the WebDAV handler for one share.
fn share_handler(name: &str, path: &Path) -> DavHandler {
    DavHandler::builder()
        .filesystem(LocalFs::new(path, false, false, false))
        .locksystem(MemLs::new())
        .strip_prefix(format!("/{name}"))
        .build_handler()
}

async fn route(
    handlers: &HashMap<String, DavHandler>,
    req: Request<Incoming>,
) -> Response<ProxyBody> {
    let segments = clean_and_split(req.uri().path());
    let Some(handler) = segments.first().and_then(|name| handlers.get(name)) else {
        let mut resp = Response::new(full_body("not found\n"));
        *resp.status_mut() = StatusCode::NOT_FOUND;
        return resp;
    };
    handler
        .handle(req)
        .await
        .map(|body| body.map_err(BoxError::from).boxed_unsync())
}

/// A running file server.
#[derive(Debug)]
pub struct FileServer {
    http: HttpServer,
    shares: Vec<String>,
}

impl FileServer {
    /// Serve `shares` as `(name, directory)` pairs.
    ///
    /// Every directory must exist. A later pair with the same name replaces
    /// an earlier one.
    pub async fn start<I>(shares: I, config: ServerConfig) -> ServerResult<Self>
    where
        I: IntoIterator<Item = (String, PathBuf)>,
    {
        let mut handlers = HashMap::new();
        for (name, path) in shares {
            if !path.is_dir() {
                return Err(ServerError::NotADirectory { name, path });
            }
            debug!(share = %name, path = %path.display(), "Serving share");
            handlers.insert(name.clone(), share_handler(&name, &path));
        }
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();

        let handlers = Arc::new(handlers);
        let handler = move |req: Request<Incoming>, _peer: SocketAddr| {
            let handlers = Arc::clone(&handlers);
            async move { route(&handlers, req).await }
        };
        let http = HttpServer::start(config, "files", handler).await?;
        info!(addr = %http.addr, shares = names.len(), "File server listening");

        Ok(Self { http, shares: names })
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.http.addr
    }

    /// Served share names, sorted.
    pub fn shares(&self) -> &[String] {
        &self.shares
    }

    /// Stop the server.
    pub async fn stop(self) {
        self.http.stop().await;
    }
}
