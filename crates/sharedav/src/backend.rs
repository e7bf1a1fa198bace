//! Per-share reverse proxy transport.
//!
//! A [`ShareBackend`] forwards requests for one share to whatever process
//! currently serves it. Connections are dialed lazily through the
//! [`Dialer`] and kept in a small idle pool that is drained when the
//! configuration generation owning the backend is torn down.

use crate::dialer::{share_base_url, Dialer};
use crate::error::{BoxError, ProxyError};
use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Body type used on both sides of the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Maximum number of idle connections kept per share.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Build a body from a complete buffer.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Build an empty body.
pub fn empty_body() -> ProxyBody {
    full_body(Bytes::new())
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Reverse proxy transport for one share.
pub struct ShareBackend {
    name: String,
    base_url: Uri,
    dialer: Dialer,
    idle: Mutex<Vec<SendRequest<ProxyBody>>>,
}

impl ShareBackend {
    /// Create the transport for `share_name`.
    pub fn new(share_name: &str, dialer: Dialer) -> Self {
        let base_url = share_base_url(share_name)
            .parse()
            .unwrap_or_else(|_| Uri::from_static("http://invalid/"));
        Self {
            name: share_name.to_string(),
            base_url,
            dialer,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Share name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Synthetic base URL of the share.
    pub fn base_url(&self) -> &Uri {
        &self.base_url
    }

    /// Number of pooled idle connections.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Drop all pooled idle connections.
    ///
    /// Connections currently carrying a response are unaffected and close
    /// once the response has been delivered.
    pub fn close_idle_connections(&self) -> usize {
        let idle = std::mem::take(&mut *self.idle.lock());
        let count = idle.len();
        if count > 0 {
            debug!(share = %self.name, count, "Closing idle backend connections");
        }
        count
    }

    /// Forward a request to the share.
    ///
    /// `sub_path` is the part of the request path below the share segment
    /// (empty or starting with `/`), `query` the raw query string.
    pub async fn round_trip(
        &self,
        req: Request<ProxyBody>,
        sub_path: &str,
        query: Option<&str>,
    ) -> Result<Response<Incoming>, ProxyError> {
        let req = self.rewrite(req, sub_path, query)?;

        let mut sender = match self.take_idle() {
            Some(sender) => sender,
            None => self.connect().await?,
        };

        let mut resp = sender
            .send_request(req)
            .await
            .map_err(ProxyError::Request)?;

        if !sender.is_closed() {
            let mut idle = self.idle.lock();
            if idle.len() < MAX_IDLE_CONNECTIONS {
                idle.push(sender);
            }
        }

        strip_hop_by_hop(resp.headers_mut());
        Ok(resp)
    }

    fn rewrite(
        &self,
        req: Request<ProxyBody>,
        sub_path: &str,
        query: Option<&str>,
    ) -> Result<Request<ProxyBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        let mut path_and_query = format!("{}{}", self.base_url.path(), sub_path);
        if let Some(query) = query {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }
        parts.uri = Uri::builder().path_and_query(path_and_query).build()?;

        strip_hop_by_hop(&mut parts.headers);
        if let Some(authority) = self.base_url.authority() {
            let host = HeaderValue::from_str(authority.as_str())
                .map_err(hyper::http::Error::from)?;
            parts.headers.insert(header::HOST, host);
        }
        // Forwarded requests always travel over HTTP/1.1 to the backend.
        parts.version = hyper::Version::HTTP_11;

        Ok(Request::from_parts(parts, body))
    }

    fn take_idle(&self) -> Option<SendRequest<ProxyBody>> {
        let mut idle = self.idle.lock();
        while let Some(sender) = idle.pop() {
            // A sender still busy with an earlier response is dropped; its
            // connection closes after that response completes.
            if !sender.is_closed() && sender.is_ready() {
                return Some(sender);
            }
        }
        None
    }

    async fn connect(&self) -> Result<SendRequest<ProxyBody>, ProxyError> {
        let host = self.base_url.authority().map_or("", |a| a.as_str());
        let stream = self.dialer.dial(host).await?;
        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ProxyError::Handshake)?;

        let share = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(share = %share, error = %e, "Backend connection closed with error");
            }
        });

        trace!(share = %self.name, "Opened backend connection");
        Ok(sender)
    }
}

impl std::fmt::Debug for ShareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareBackend")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
