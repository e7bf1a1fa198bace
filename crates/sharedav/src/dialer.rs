//! Backend dialing for shares.
//!
//! Every share is addressed through a synthetic base URL of the form
//! `http://<hex(name)>/<escaped(name)>`. The host is what the transport
//! hands to [`Dialer::dial`]; it is decoded back to the share name and
//! resolved against the *current* configuration, so a backend that was
//! built for an older generation still dials whatever serves the share now.

use crate::error::DialError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::either::Either;
use tracing::trace;

/// Encode a share name as a syntactically valid host label.
pub fn encode_share_host(share_name: &str) -> String {
    hex::encode(share_name.as_bytes())
}

/// Decode the share name from a `host` or `host:port` authority.
pub fn decode_share_host(authority: &str) -> Result<String, DialError> {
    let host = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    };
    let bytes =
        hex::decode(host).map_err(|_| DialError::InvalidShareAddress(authority.to_string()))?;
    String::from_utf8(bytes).map_err(|_| DialError::InvalidShareAddress(authority.to_string()))
}

/// Base URL a share is reached through.
pub fn share_base_url(share_name: &str) -> String {
    format!(
        "http://{}/{}",
        encode_share_host(share_name),
        urlencoding::encode(share_name)
    )
}

/// Where a share's content is currently served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    /// Loopback or other network socket.
    Tcp(SocketAddr),
    /// Local socket path.
    Local(PathBuf),
}

impl BackendAddr {
    /// Classify a reported address: socket addresses are TCP, anything else
    /// is a local socket path.
    pub fn parse(addr: &str) -> Self {
        let addr = addr.trim();
        match addr.parse::<SocketAddr>() {
            Ok(sa) => BackendAddr::Tcp(sa),
            Err(_) => BackendAddr::Local(PathBuf::from(addr)),
        }
    }

    /// Connect to this address.
    ///
    /// There is no fallback from one kind of socket to the other.
    pub async fn connect(&self) -> Result<BackendStream, DialError> {
        match self {
            BackendAddr::Tcp(sa) => {
                let stream = TcpStream::connect(sa).await.map_err(|source| DialError::Connect {
                    addr: sa.to_string(),
                    source,
                })?;
                // Best effort: WebDAV traffic is request/response shaped.
                let _ = stream.set_nodelay(true);
                Ok(Either::Left(stream))
            }
            BackendAddr::Local(path) => {
                let stream = UnixStream::connect(path).await.map_err(|source| DialError::Connect {
                    addr: path.display().to_string(),
                    source,
                })?;
                Ok(Either::Right(stream))
            }
        }
    }
}

/// Looks up the address currently serving a share.
pub trait AddressResolver: Send + Sync {
    /// Resolve the live backend address for `share_name`.
    fn backend_addr(&self, share_name: &str) -> Result<String, DialError>;
}

/// Dials share backends through an [`AddressResolver`].
///
/// Holds the resolver weakly so per-share transports never keep the
/// configuration that owns them alive.
#[derive(Clone)]
pub struct Dialer {
    resolver: Weak<dyn AddressResolver>,
}

impl Dialer {
    /// Create a dialer backed by `resolver`.
    pub fn new(resolver: Weak<dyn AddressResolver>) -> Self {
        Self { resolver }
    }

    /// Create a dialer from a strong reference.
    pub fn from_arc<R: AddressResolver + 'static>(resolver: &Arc<R>) -> Self {
        let resolver: Arc<dyn AddressResolver> = resolver.clone();
        Self::new(Arc::downgrade(&resolver))
    }

    /// Dial the backend for a synthetic share host.
    pub async fn dial(&self, share_host: &str) -> Result<BackendStream, DialError> {
        let share_name = decode_share_host(share_host)?;
        let resolver = self.resolver.upgrade().ok_or(DialError::Closed)?;
        let addr = resolver.backend_addr(&share_name)?;
        drop(resolver);

        let addr = BackendAddr::parse(&addr);
        trace!(share = %share_name, addr = ?addr, "Dialing share backend");
        addr.connect().await
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("live", &(self.resolver.strong_count() > 0))
            .finish()
    }
}

/// Connection to a share backend: TCP on the left, a local socket on the
/// right.
pub type BackendStream = Either<TcpStream, UnixStream>;
