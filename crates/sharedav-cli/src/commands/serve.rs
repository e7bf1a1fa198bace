//! Serve command - run the front endpoint and supervise user servers.
//!
//! Shares and permissions are re-read on `SIGHUP`; the listener and the
//! supervision settings are fixed for the lifetime of the process.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Args as ClapArgs;
use tracing::{info, instrument, warn};

use sharedav::{
    Config, FileServer, FileSystemForRemote, ServerConfig, ShareServer, StaticPermissions,
};

use crate::config;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Configuration file [default: platform config dir]
    #[arg(short, long, env = "SHAREDAV_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides [server] in the configuration)
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<SocketAddr>,

    /// Serve every share from this process instead of one process per owner
    #[arg(long)]
    pub no_privilege_separation: bool,
}

/// Everything a reload touches.
struct Service {
    remote: FileSystemForRemote,
    permissions: Arc<ArcSwap<StaticPermissions>>,
    /// In-process file server, only without privilege separation.
    file_server: Option<FileServer>,
}

impl Service {
    async fn apply(&mut self, config: &Config) -> Result<()> {
        self.permissions.store(Arc::new(config.permissions.clone()));

        if !self.remote.options().privilege_separation {
            let pairs = config
                .shares
                .iter()
                .map(|share| (share.name.clone(), share.path.clone()));
            let server = FileServer::start(pairs, ServerConfig::default())
                .await
                .context("Failed to start file server")?;
            self.remote.set_file_server_addr(server.addr().to_string());
            if let Some(previous) = self.file_server.replace(server) {
                previous.stop().await;
            }
        }

        self.remote.set_shares(config.shares.iter().cloned());
        info!(shares = config.shares.len(), "Shares configured");
        Ok(())
    }

    async fn shutdown(self) {
        self.remote.close();
        if let Some(server) = self.file_server {
            server.stop().await;
        }
    }
}

#[instrument(level = "info", name = "cmd::serve", skip_all)]
pub async fn execute(args: &Args) -> Result<()> {
    let path = config::resolve(args.config.as_deref())?;
    let mut cfg = config::load(&path)?;
    if let Some(listen) = args.listen {
        cfg.server = ServerConfig::from_addr(listen);
    }
    if args.no_privilege_separation {
        cfg.supervisor.privilege_separation = false;
    }

    let remote = FileSystemForRemote::new(cfg.remote_options());
    let permissions = Arc::new(ArcSwap::from_pointee(cfg.permissions.clone()));
    let mut service = Service {
        remote: remote.clone(),
        permissions: Arc::clone(&permissions),
        file_server: None,
    };
    service.apply(&cfg).await?;

    let server = ShareServer::start(remote, permissions, cfg.server)
        .await
        .context("Failed to start share server")?;
    println!("{}", server.url());

    wait_for_shutdown(&path, &mut service).await?;

    info!("Shutting down");
    service.shutdown().await;
    server.stop().await;
    Ok(())
}

/// Block until SIGINT or SIGTERM, reloading the configuration on SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(path: &Path, service: &mut Service) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to set SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to set SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => reload(path, service).await,
            _ = terminate.recv() => return Ok(()),
            result = tokio::signal::ctrl_c() => {
                return result.context("Failed to wait for Ctrl-C");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_path: &Path, _service: &mut Service) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")
}

/// A broken configuration keeps the current shares.
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload(path: &Path, service: &mut Service) {
    info!(path = %path.display(), "Reloading configuration");
    let result = match config::load(path) {
        Ok(cfg) => service.apply(&cfg).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(error = %format!("{e:#}"), "Reload failed, keeping previous shares");
    }
}
