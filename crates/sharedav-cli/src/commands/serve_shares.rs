//! Serve-shares command - the user server process.
//!
//! Serves the given shares over WebDAV, prints the listen address as the
//! first line on stdout and runs until it is killed or interrupted.

use std::ffi::OsString;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args as ClapArgs;
use tracing::{debug, instrument};

use sharedav::{normalize_share_name, FileServer, ServerConfig};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Share name and directory pairs
    #[arg(value_names = ["NAME", "PATH"], num_args = 2.., required = true, allow_hyphen_values = true)]
    pub shares: Vec<OsString>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR", default_value = "127.0.0.1:0")]
    pub listen: SocketAddr,
}

/// Split the positional arguments into `(name, path)` pairs.
fn share_pairs(args: Vec<OsString>) -> Result<Vec<(String, PathBuf)>> {
    if args.len() % 2 != 0 {
        bail!("Expected NAME PATH pairs, got {} arguments", args.len());
    }
    let mut pairs = Vec::with_capacity(args.len() / 2);
    let mut args = args.into_iter();
    while let (Some(name), Some(path)) = (args.next(), args.next()) {
        let name = name
            .into_string()
            .map_err(|name| anyhow::anyhow!("Share name {} is not valid UTF-8", name.to_string_lossy()))?;
        let name = normalize_share_name(&name)?;
        pairs.push((name, PathBuf::from(path)));
    }
    Ok(pairs)
}

#[instrument(level = "info", name = "cmd::serve_shares", skip_all)]
pub async fn execute(args: Args) -> Result<()> {
    let pairs = share_pairs(args.shares)?;
    debug!(shares = pairs.len(), "Starting file server");

    let server = FileServer::start(pairs, ServerConfig::from_addr(args.listen))
        .await
        .context("Failed to start file server")?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", server.addr()).context("Failed to report address")?;
    stdout.flush().context("Failed to report address")?;
    drop(stdout);

    wait_for_termination().await?;
    server.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to set SIGTERM handler")?;
    tokio::select! {
        _ = terminate.recv() => Ok(()),
        result = tokio::signal::ctrl_c() => result.context("Failed to wait for Ctrl-C"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")
}
