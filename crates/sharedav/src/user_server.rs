//! Supervision of per-owner file server processes.
//!
//! Every distinct share owner gets one [`UserServer`]. Its run loop starts
//! the executable's `serve-shares` subcommand with a `(name, path)` pair per
//! share, publishes the address the child prints on its first stdout line
//! and restarts the child with exponential backoff whenever it exits. The
//! loop ends only when the server is closed.

use crate::backoff::{Backoff, BackoffConfig};
use crate::error::UserServerError;
use crate::privilege::{Launcher, PrivilegeDropLauncher};
use crate::share::Share;
use parking_lot::RwLock;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subcommand that makes the executable serve shares.
pub const SERVE_SUBCOMMAND: &str = "serve-shares";

/// How user servers are launched and restarted.
#[derive(Clone)]
pub struct SupervisorOptions {
    /// Restart backoff.
    pub backoff: BackoffConfig,
    /// Subcommand placed before the share arguments.
    pub subcommand: String,
    /// Builds the command for an owner.
    pub launcher: Arc<dyn Launcher>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            subcommand: SERVE_SUBCOMMAND.to_string(),
            launcher: Arc::new(PrivilegeDropLauncher::default()),
        }
    }
}

impl std::fmt::Debug for SupervisorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorOptions")
            .field("backoff", &self.backoff)
            .field("subcommand", &self.subcommand)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct State {
    addr: Option<String>,
    closed: bool,
}

/// File server process for all shares of one owner.
pub struct UserServer {
    username: String,
    executable: PathBuf,
    shares: Vec<Arc<Share>>,
    options: SupervisorOptions,
    state: RwLock<State>,
    stop: CancellationToken,
}

impl UserServer {
    /// Create a server for `username`. Shares are served in name order.
    pub fn new(
        username: impl Into<String>,
        executable: impl Into<PathBuf>,
        mut shares: Vec<Arc<Share>>,
        options: SupervisorOptions,
    ) -> Self {
        shares.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            username: username.into(),
            executable: executable.into(),
            shares,
            options,
            state: RwLock::new(State::default()),
            stop: CancellationToken::new(),
        }
    }

    /// Owner the server runs as.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Executable started for the server.
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Shares served by this server.
    pub fn shares(&self) -> &[Arc<Share>] {
        &self.shares
    }

    /// Address reported by the most recently started child, if any.
    pub fn addr(&self) -> Option<String> {
        self.state.read().addr.clone()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Arguments passed to the executable.
    pub fn args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(1 + self.shares.len() * 2);
        args.push(OsString::from(&self.options.subcommand));
        for share in &self.shares {
            args.push(OsString::from(&share.name));
            args.push(share.path.clone().into_os_string());
        }
        args
    }

    /// Stop the server. A running child is killed immediately and the run
    /// loop exits without restarting.
    pub fn close(&self) {
        {
            let mut state = self.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.stop.cancel();
        debug!(user = %self.username, "Closing user server");
    }

    /// Spawn the run loop on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run_loop())
    }

    /// Keep the child running until closed.
    pub async fn run_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.options.backoff);
        loop {
            if self.is_closed() {
                return;
            }

            let result = self.run().await;
            if self.is_closed() {
                debug!(user = %self.username, "User server stopped");
                return;
            }

            let delay = backoff.next_delay(Instant::now());
            let reason = match result {
                Ok(status) => UserServerError::Exited(status),
                Err(e) => e,
            };
            warn!(
                user = %self.username,
                executable = %self.executable.display(),
                error = %reason,
                delay = ?delay,
                "User server stopped, will try again"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.stop.cancelled() => return,
            }
        }
    }

    /// Start the child once and wait for it to exit.
    async fn run(&self) -> Result<ExitStatus, UserServerError> {
        let mut cmd = self
            .options
            .launcher
            .command(&self.username, &self.executable)
            .await?;
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a stop also reaches anything the child forks.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(UserServerError::Start)?;
        let stdout = child.stdout.take().ok_or(UserServerError::Pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(UserServerError::Pipe("stderr"))?;
        let mut stdout = BufReader::new(stdout).lines();

        let first_line = tokio::select! {
            line = stdout.next_line() => line.map_err(UserServerError::ReadAddr)?,
            () = self.stop.cancelled() => {
                self.kill(&mut child).await;
                return Err(UserServerError::Stopped);
            }
        };
        let addr = match first_line.as_deref().map(str::trim) {
            Some(addr) if !addr.is_empty() => addr.to_string(),
            _ => return Err(UserServerError::NoAddress),
        };

        self.drain(stdout, "stdout");
        self.drain(BufReader::new(stderr).lines(), "stderr");

        info!(user = %self.username, addr = %addr, "User server listening");
        self.state.write().addr = Some(addr);

        tokio::select! {
            status = child.wait() => status.map_err(UserServerError::Wait),
            () = self.stop.cancelled() => {
                self.kill(&mut child).await;
                Err(UserServerError::Stopped)
            }
        }
    }

    /// Forward the rest of a child stream to the log so the child never
    /// blocks on a full pipe. Ends when the pipe closes.
    fn drain<R>(&self, mut lines: Lines<R>, stream: &'static str)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let user = self.username.clone();
        tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => info!(user = %user, stream, "serve-shares: {line}"),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(user = %user, stream, error = %e, "Stopped reading child output");
                        break;
                    }
                }
            }
        });
    }

    async fn kill(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
        if let Err(e) = child.kill().await {
            warn!(user = %self.username, error = %e, "Failed to kill user server");
        }
    }
}

impl std::fmt::Debug for UserServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserServer")
            .field("username", &self.username)
            .field("executable", &self.executable)
            .field("shares", &self.shares)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

impl Drop for UserServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
