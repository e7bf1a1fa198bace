//! Serve local directory shares to remote peers over WebDAV.
//!
//! Every share is a local directory owned by a local account. Requests from
//! remote principals arrive at a single HTTP endpoint, are filtered by a
//! share-level [`Permissions`] decision and are then reverse-proxied to a
//! file server that reads the share as its owner, never as a more
//! privileged account.
//!
//! # How It Works
//!
//! 1. [`FileSystemForRemote::set_shares`] groups shares by owner and starts
//!    one [`UserServer`] per owner. Each runs this crate's executable with
//!    the `serve-shares` subcommand as that owner (through `sudo` when
//!    possible) and learns its address from the first line it prints.
//! 2. The new share table, user servers and per-share proxy backends are
//!    published together as one [`Generation`]; the previous one is torn
//!    down afterwards.
//! 3. [`FileSystemForRemote::serve_http_with_perms`] checks permissions,
//!    resolves the share from the first path segment and forwards the
//!    request to the owner's file server.
//!
//! # Example
//!
//! ```ignore
//! use sharedav::{FileSystemForRemote, Permission, ServerConfig, Share, ShareServer};
//! use std::sync::Arc;
//!
//! let remote = FileSystemForRemote::default();
//! remote.set_shares([Share::new("docs", "/home/alice/Documents", "alice")]);
//!
//! let read_only = Arc::new(|_: &str| Permission::ReadOnly);
//! let server = ShareServer::start(remote.clone(), read_only, ServerConfig::default()).await?;
//! println!("Serving on {}", server.url());
//! ```
//!
//! # Security
//!
//! A user server is never started as root: without working `sudo` the
//! process must itself be unprivileged, otherwise the owner's shares stay
//! unavailable and the failure is logged and retried.

mod backend;
mod backoff;
mod config;
mod dialer;
mod error;
mod file_server;
mod privilege;
mod remote;
mod router;
mod server;
mod share;
mod user_server;

// Public exports
pub use backend::{empty_body, full_body, strip_hop_by_hop, ProxyBody, ShareBackend};
pub use backoff::{Backoff, BackoffConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
pub use config::{Config, SupervisorConfig};
pub use dialer::{
    decode_share_host, encode_share_host, share_base_url, AddressResolver, BackendAddr,
    BackendStream, Dialer,
};
pub use error::{
    BoxError, ConfigError, ConfigResult, DialError, ProxyError, ServerError, ServerResult,
    UserServerError,
};
pub use file_server::FileServer;
pub use privilege::{
    assert_owner_not_root, select_strategy, CurrentUser, LaunchStrategy, Launcher,
    PrivilegeDropLauncher, DEFAULT_PROBE_TIMEOUT,
};
pub use remote::{FileSystemForRemote, Generation, RemoteOptions};
pub use router::{clean_and_split, is_write_method, CompositeHandler, WRITE_METHODS};
pub use server::{HttpServer, ServerConfig, ShareServer};
pub use share::{normalize_share_name, Permission, Permissions, Share, StaticPermissions};
pub use user_server::{SupervisorOptions, UserServer, SERVE_SUBCOMMAND};

/// Re-exported so custom [`Launcher`] implementations can name the future
/// type without depending on `futures` directly.
pub use futures::future::BoxFuture;
