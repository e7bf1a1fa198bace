//! Share configuration coordinator.
//!
//! [`FileSystemForRemote`] owns the live [`Generation`]: the share table,
//! one [`UserServer`] per owner and one [`ShareBackend`] per share. A new
//! share set builds a complete generation off to the side, publishes it
//! with a single atomic swap and only then tears the previous one down.
//! Requests load the current generation wait-free and keep their own
//! reference to the backend they resolved, so a swap never pulls a backend
//! out from under a request in flight.

use crate::backend::ShareBackend;
use crate::dialer::{AddressResolver, Dialer};
use crate::error::DialError;
use crate::share::Share;
use crate::user_server::{SupervisorOptions, UserServer};
use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info};

/// Options for [`FileSystemForRemote`].
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Serve each owner's shares from a separate process running as that
    /// owner. When disabled every share is served from the address set
    /// with [`FileSystemForRemote::set_file_server_addr`].
    pub privilege_separation: bool,
    /// Executable started for user servers. Defaults to the current
    /// executable.
    pub executable: Option<PathBuf>,
    /// User server launch and restart settings.
    pub supervisor: SupervisorOptions,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            privilege_separation: cfg!(unix),
            executable: None,
            supervisor: SupervisorOptions::default(),
        }
    }
}

/// One installed share configuration.
#[derive(Debug, Default)]
pub struct Generation {
    shares: HashMap<String, Arc<Share>>,
    user_servers: HashMap<String, Arc<UserServer>>,
    backends: BTreeMap<String, Arc<ShareBackend>>,
}

impl Generation {
    /// Share by name.
    pub fn share(&self, name: &str) -> Option<&Arc<Share>> {
        self.shares.get(name)
    }

    /// Number of shares.
    pub fn len(&self) -> usize {
        self.shares.len()
    }

    /// Whether the generation has no shares.
    pub fn is_empty(&self) -> bool {
        self.shares.is_empty()
    }

    /// User server for an owner.
    pub fn user_server(&self, owner: &str) -> Option<&Arc<UserServer>> {
        self.user_servers.get(owner)
    }

    /// All user servers, keyed by owner.
    pub fn user_servers(&self) -> &HashMap<String, Arc<UserServer>> {
        &self.user_servers
    }

    /// Backend for a share.
    pub fn backend(&self, name: &str) -> Option<&Arc<ShareBackend>> {
        self.backends.get(name)
    }

    /// All backends in share name order.
    pub fn backends(&self) -> &BTreeMap<String, Arc<ShareBackend>> {
        &self.backends
    }

    fn teardown(&self) {
        for server in self.user_servers.values() {
            server.close();
        }
        let closed: usize = self
            .backends
            .values()
            .map(|backend| backend.close_idle_connections())
            .sum();
        debug!(
            user_servers = self.user_servers.len(),
            idle_connections = closed,
            "Tore down previous share generation"
        );
    }
}

struct Inner {
    options: RemoteOptions,
    current: ArcSwap<Generation>,
    file_server_addr: ArcSwapOption<String>,
    /// Serializes writers; readers never take it.
    update: Mutex<()>,
}

impl AddressResolver for Inner {
    fn backend_addr(&self, share_name: &str) -> Result<String, DialError> {
        let generation = self.current.load();
        let share = generation
            .share(share_name)
            .ok_or_else(|| DialError::UnknownShare(share_name.to_string()))?;

        let addr = if self.options.privilege_separation {
            generation
                .user_server(&share.as_user)
                .and_then(|server| server.addr())
        } else {
            self.file_server_addr.load_full().map(|addr| addr.to_string())
        };

        addr.filter(|addr| !addr.is_empty())
            .ok_or_else(|| DialError::NoAddress(share_name.to_string()))
    }
}

/// Serves local shares to remote principals.
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct FileSystemForRemote {
    inner: Arc<Inner>,
}

impl Default for FileSystemForRemote {
    fn default() -> Self {
        Self::new(RemoteOptions::default())
    }
}

impl FileSystemForRemote {
    /// Create a file system with no shares.
    pub fn new(options: RemoteOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                current: ArcSwap::from_pointee(Generation::default()),
                file_server_addr: ArcSwapOption::empty(),
                update: Mutex::new(()),
            }),
        }
    }

    /// Options this file system was created with.
    pub fn options(&self) -> &RemoteOptions {
        &self.inner.options
    }

    /// The currently installed generation.
    pub fn snapshot(&self) -> Arc<Generation> {
        self.inner.current.load_full()
    }

    /// Set the address of the shared file server used when privilege
    /// separation is disabled.
    pub fn set_file_server_addr(&self, addr: impl Into<String>) {
        let addr = addr.into();
        debug!(addr = %addr, "Setting file server address");
        self.inner.file_server_addr.store(Some(Arc::new(addr)));
    }

    /// Install a new share set.
    ///
    /// With privilege separation, one user server is started per distinct
    /// owner before the new generation is published; the previous
    /// generation's user servers are stopped afterwards. Shares are keyed
    /// by name, a later share replaces an earlier one with the same name.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn set_shares<I>(&self, shares: I)
    where
        I: IntoIterator<Item = Share>,
    {
        let _guard = self.inner.update.lock();

        let shares: HashMap<String, Arc<Share>> = shares
            .into_iter()
            .map(|share| (share.name.clone(), Arc::new(share)))
            .collect();

        let mut user_servers = HashMap::new();
        if self.inner.options.privilege_separation && !shares.is_empty() {
            let executable = match self.executable() {
                Ok(executable) => executable,
                Err(e) => {
                    error!(error = %e, "Can't find executable, keeping previous shares");
                    return;
                }
            };
            user_servers = self.start_user_servers(&shares, &executable);
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let resolver: Weak<dyn AddressResolver> = weak;
        let backends = shares
            .keys()
            .map(|name| {
                let backend = ShareBackend::new(name, Dialer::new(resolver.clone()));
                (name.clone(), Arc::new(backend))
            })
            .collect();

        info!(
            shares = shares.len(),
            user_servers = user_servers.len(),
            "Installing share configuration"
        );
        let previous = self.inner.current.swap(Arc::new(Generation {
            shares,
            user_servers,
            backends,
        }));
        previous.teardown();
    }

    /// Remove all shares and stop every user server.
    pub fn close(&self) {
        let _guard = self.inner.update.lock();
        let previous = self.inner.current.swap(Arc::new(Generation::default()));
        previous.teardown();
        info!("Closed file system for remote");
    }

    fn executable(&self) -> std::io::Result<PathBuf> {
        match &self.inner.options.executable {
            Some(executable) => Ok(executable.clone()),
            None => std::env::current_exe(),
        }
    }

    fn start_user_servers(
        &self,
        shares: &HashMap<String, Arc<Share>>,
        executable: &std::path::Path,
    ) -> HashMap<String, Arc<UserServer>> {
        let mut by_owner: HashMap<&str, Vec<Arc<Share>>> = HashMap::new();
        for share in shares.values() {
            by_owner
                .entry(share.as_user.as_str())
                .or_default()
                .push(Arc::clone(share));
        }

        by_owner
            .into_iter()
            .map(|(owner, owned)| {
                let server = Arc::new(UserServer::new(
                    owner,
                    executable,
                    owned,
                    self.inner.options.supervisor.clone(),
                ));
                server.spawn();
                (owner.to_string(), server)
            })
            .collect()
    }
}

impl std::fmt::Debug for FileSystemForRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemForRemote")
            .field("options", &self.inner.options)
            .field("shares", &self.inner.current.load().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UserServerError;
    use crate::privilege::Launcher;
    use futures::future::BoxFuture;
    use std::path::Path;
    use tokio::process::Command;

    /// Never starts anything, so user servers stay without an address.
    struct RefusingLauncher;

    impl Launcher for RefusingLauncher {
        fn command<'a>(
            &'a self,
            username: &'a str,
            _executable: &'a Path,
        ) -> BoxFuture<'a, Result<Command, UserServerError>> {
            Box::pin(async move { Err(UserServerError::RunningAsRoot(username.to_string())) })
        }
    }

    fn separated() -> FileSystemForRemote {
        FileSystemForRemote::new(RemoteOptions {
            privilege_separation: true,
            executable: Some(PathBuf::from("/usr/bin/sharedav")),
            supervisor: SupervisorOptions {
                launcher: Arc::new(RefusingLauncher),
                ..SupervisorOptions::default()
            },
        })
    }

    fn shared() -> FileSystemForRemote {
        FileSystemForRemote::new(RemoteOptions {
            privilege_separation: false,
            ..RemoteOptions::default()
        })
    }

    fn resolve(fs: &FileSystemForRemote, name: &str) -> Result<String, DialError> {
        fs.inner.backend_addr(name)
    }

    #[tokio::test]
    async fn test_one_user_server_per_owner() {
        let fs = separated();
        fs.set_shares([
            Share::new("a", "/srv/a", "alice"),
            Share::new("b", "/srv/b", "alice"),
            Share::new("c", "/srv/c", "bob"),
        ]);

        let generation = fs.snapshot();
        assert_eq!(generation.len(), 3);
        assert_eq!(generation.user_servers().len(), 2);

        let alice = generation.user_server("alice").unwrap();
        let names: Vec<&str> = alice.shares().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(generation.user_server("bob").unwrap().shares().len(), 1);
        assert_eq!(
            generation.backends().keys().map(String::as_str).collect::<Vec<_>>(),
            ["a", "b", "c"]
        );

        fs.close();
    }

    #[tokio::test]
    async fn test_swap_stops_previous_user_servers() {
        let fs = separated();
        fs.set_shares([Share::new("a", "/srv/a", "alice")]);
        let first = fs.snapshot();

        fs.set_shares([Share::new("b", "/srv/b", "bob")]);
        let second = fs.snapshot();

        assert!(first.user_server("alice").unwrap().is_closed());
        assert!(!second.user_server("bob").unwrap().is_closed());
        assert!(second.share("a").is_none());
        assert!(matches!(resolve(&fs, "a"), Err(DialError::UnknownShare(_))));

        fs.close();
        assert!(second.user_server("bob").unwrap().is_closed());
        assert!(fs.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_empty_share_set_installs_empty_generation() {
        let fs = separated();
        fs.set_shares([Share::new("a", "/srv/a", "alice")]);
        fs.set_shares(Vec::new());

        let generation = fs.snapshot();
        assert!(generation.is_empty());
        assert!(generation.user_servers().is_empty());
    }

    #[tokio::test]
    async fn test_owner_without_address_is_no_address() {
        let fs = separated();
        fs.set_shares([Share::new("a", "/srv/a", "alice")]);
        assert!(matches!(resolve(&fs, "a"), Err(DialError::NoAddress(name)) if name == "a"));
        fs.close();
    }

    #[test]
    fn test_shared_file_server_address() {
        let fs = shared();
        fs.set_shares([Share::new("a", "/srv/a", "alice")]);
        assert!(fs.snapshot().user_servers().is_empty());
        assert!(matches!(resolve(&fs, "a"), Err(DialError::NoAddress(_))));

        fs.set_file_server_addr("127.0.0.1:9999");
        assert_eq!(resolve(&fs, "a").unwrap(), "127.0.0.1:9999");
        assert!(matches!(resolve(&fs, "b"), Err(DialError::UnknownShare(_))));
    }

    #[test]
    fn test_backends_do_not_keep_file_system_alive() {
        let fs = shared();
        fs.set_shares([Share::new("a", "/srv/a", "alice")]);
        let backend = Arc::clone(fs.snapshot().backend("a").unwrap());
        let weak = Arc::downgrade(&fs.inner);

        drop(fs);
        assert!(weak.upgrade().is_none());
        assert_eq!(backend.name(), "a");
    }
}
