//! Error types for share routing, backend dialing and supervision.
//!
//! Errors are kept scoped to the operation that produced them: dial and
//! proxy errors end up in a single HTTP response, supervision errors are
//! only ever logged by the supervisor's own run loop, and configuration
//! errors surface to whoever loaded the configuration.

use hyper::StatusCode;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Boxed error used for proxied HTTP bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while resolving and connecting to a share backend.
#[derive(Debug, Error)]
pub enum DialError {
    /// The synthetic share host could not be decoded back to a share name.
    #[error("unable to parse share address {0}")]
    InvalidShareAddress(String),

    /// The share is not part of the current configuration.
    #[error("unknown share {0}")]
    UnknownShare(String),

    /// No backend has published an address for the share yet.
    #[error("unable to determine address for share {0}")]
    NoAddress(String),

    /// The file system was dropped while a request was still dialing.
    #[error("file system for remote is closed")]
    Closed,

    /// Connecting to the resolved address failed.
    #[error("connect to {addr}: {source}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// Whether a client may reasonably retry the same request later.
    ///
    /// A missing address means the owner's server is (re)starting.
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::NoAddress(_) | DialError::Connect { .. })
    }
}

/// Errors produced while forwarding a request to a share backend.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend could not be dialed.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// HTTP handshake with the backend failed.
    #[error("backend handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    /// The request could not be sent or the response head was not received.
    #[error("backend request failed: {0}")]
    Request(#[source] hyper::Error),

    /// The forwarded request URI could not be built.
    #[error("invalid backend uri: {0}")]
    InvalidUri(#[from] hyper::http::Error),
}

impl ProxyError {
    /// HTTP status reported to the client for this error.
    ///
    /// Every backend failure is a gateway error so it stays distinct from
    /// the 404 and 403 answers of the permission check.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUri(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Dial(_) | ProxyError::Handshake(_) | ProxyError::Request(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// Reasons a user server run ended.
///
/// These never reach request handlers; the supervisor logs them and
/// restarts after a backoff.
#[derive(Debug, Error)]
pub enum UserServerError {
    /// The process would read shares with super-user privileges.
    #[error("refusing to serve shares as root: {0}")]
    RunningAsRoot(String),

    /// The current or target account could not be looked up.
    #[error("unable to look up user {user}: {reason}")]
    UserLookup {
        /// Account that was looked up.
        user: String,
        /// Why the lookup failed.
        reason: String,
    },

    /// A standard stream of the child was not piped.
    #[error("{0} pipe unavailable")]
    Pipe(&'static str),

    /// Spawning the child failed.
    #[error("start: {0}")]
    Start(#[source] io::Error),

    /// Reading the address line failed.
    #[error("read addr: {0}")]
    ReadAddr(#[source] io::Error),

    /// The child closed stdout without reporting an address.
    #[error("child exited before reporting its address")]
    NoAddress,

    /// Waiting for the child failed.
    #[error("wait: {0}")]
    Wait(#[source] io::Error),

    /// The child exited on its own.
    #[error("exited with {0}")]
    Exited(ExitStatus),

    /// The server was closed while the child was running.
    #[error("stopped")]
    Stopped,
}

/// Errors produced while starting an HTTP listener.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The bound address could not be read back.
    #[error("failed to read local address: {0}")]
    LocalAddr(#[source] io::Error),

    /// A share path is not a directory.
    #[error("share {name:?} is not a directory: {path}")]
    NotADirectory {
        /// Share name.
        name: String,
        /// Offending path.
        path: PathBuf,
    },
}

/// Result type for starting servers.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors produced while loading or validating share configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that was read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The configuration is not valid TOML or has the wrong shape.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A share name is empty or contains characters outside the allowed set.
    #[error("invalid share name {0:?}")]
    InvalidShareName(String),

    /// Two shares normalize to the same name.
    #[error("duplicate share {0:?}")]
    DuplicateShare(String),

    /// A share path is relative.
    #[error("share {name:?} path must be absolute: {path}")]
    RelativePath {
        /// Share name.
        name: String,
        /// Offending path.
        path: PathBuf,
    },

    /// A share has no owning account.
    #[error("share {0:?} has no owner")]
    MissingOwner(String),
}

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;
