//! Launching user servers without elevated privileges.
//!
//! A user server must read its shares as the share owner, never as root.
//! Two strategies exist:
//!
//! - If `sudo -n -u <owner>` works non-interactively (probed by running the
//!   executable with `-h`), the server is started through sudo.
//! - Otherwise the server runs as the current user, which is only allowed
//!   when the current user is not root.
//!
//! Anything else fails closed.

use crate::error::UserServerError;
use futures::future::BoxFuture;
use nix::unistd::{Uid, User};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Upper bound for the sudo capability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Builds the command that starts a user server for an owner.
///
/// The returned command has only the program and any wrapper arguments;
/// the supervisor appends the server arguments and configures stdio.
pub trait Launcher: Send + Sync {
    /// Prepare the command that runs `executable` as `username`.
    fn command<'a>(
        &'a self,
        username: &'a str,
        executable: &'a Path,
    ) -> BoxFuture<'a, Result<Command, UserServerError>>;
}

/// How a user server gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStrategy {
    /// Through `sudo -n -u <owner>`.
    Sudo,
    /// Directly, as the current non-root user.
    Direct,
}

/// Effective account of this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    /// Account name, or the numeric uid if it has no passwd entry.
    pub name: String,
    /// Whether the effective uid is 0.
    pub is_root: bool,
}

impl CurrentUser {
    /// Look up the effective user of this process.
    pub fn effective() -> Self {
        let uid = Uid::effective();
        let name = match User::from_uid(uid) {
            Ok(Some(user)) => user.name,
            _ => uid.to_string(),
        };
        Self {
            name,
            is_root: uid.is_root(),
        }
    }
}

/// Pick the launch strategy.
///
/// Without a working sudo the current user must not be root, because the
/// server would otherwise read shares with super-user privileges.
pub fn select_strategy(
    can_sudo: bool,
    current: &CurrentUser,
) -> Result<LaunchStrategy, UserServerError> {
    if can_sudo {
        return Ok(LaunchStrategy::Sudo);
    }
    if current.is_root {
        return Err(UserServerError::RunningAsRoot(current.name.clone()));
    }
    Ok(LaunchStrategy::Direct)
}

/// Refuse owners that resolve to the super-user.
pub fn assert_owner_not_root(username: &str) -> Result<(), UserServerError> {
    match User::from_name(username) {
        Ok(Some(user)) if user.uid.is_root() => {
            Err(UserServerError::RunningAsRoot(username.to_string()))
        }
        Ok(_) => Ok(()),
        Err(e) => Err(UserServerError::UserLookup {
            user: username.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Default launcher: sudo to the owner when possible, otherwise run as the
/// current user if that user is not root.
#[derive(Debug, Clone)]
pub struct PrivilegeDropLauncher {
    sudo: PathBuf,
    probe_timeout: Duration,
}

impl Default for PrivilegeDropLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl PrivilegeDropLauncher {
    /// Create a launcher using `sudo` from `PATH`.
    pub fn new() -> Self {
        Self {
            sudo: PathBuf::from("sudo"),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Use a different sudo binary.
    #[must_use]
    pub fn with_sudo(mut self, sudo: impl Into<PathBuf>) -> Self {
        self.sudo = sudo.into();
        self
    }

    /// Change the capability probe timeout.
    #[must_use]
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Whether `executable` can be run as `username` through sudo without a
    /// password prompt. Any failure, including a timeout, counts as no.
    pub async fn can_sudo(&self, username: &str, executable: &Path) -> bool {
        let mut probe = Command::new(&self.sudo);
        probe
            .args(["-n", "-u", username])
            .arg(executable)
            .arg("-h")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.probe_timeout, probe.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(user = %username, error = %e, "sudo probe failed to start");
                false
            }
            Err(_) => {
                debug!(user = %username, timeout = ?self.probe_timeout, "sudo probe timed out");
                false
            }
        }
    }
}

impl Launcher for PrivilegeDropLauncher {
    fn command<'a>(
        &'a self,
        username: &'a str,
        executable: &'a Path,
    ) -> BoxFuture<'a, Result<Command, UserServerError>> {
        Box::pin(async move {
            let can_sudo = self.can_sudo(username, executable).await;
            match select_strategy(can_sudo, &CurrentUser::effective())? {
                LaunchStrategy::Sudo => {
                    assert_owner_not_root(username)?;
                    info!(user = %username, "Starting file server as user");
                    let mut cmd = Command::new(&self.sudo);
                    cmd.args(["-n", "-u", username]).arg(executable);
                    Ok(cmd)
                }
                LaunchStrategy::Direct => {
                    info!(user = %username, "Starting file server as ourselves");
                    Ok(Command::new(executable))
                }
            }
        })
    }
}
