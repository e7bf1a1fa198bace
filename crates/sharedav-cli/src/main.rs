#![deny(unsafe_code)]

mod commands;
mod config;
mod exit_code;

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
#[cfg(feature = "tokio-console")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sharedav::{ConfigError, ServerError};

use crate::commands::{serve, serve_shares, shares};

/// Serve local directory shares to remote peers over WebDAV
#[derive(Parser)]
#[command(name = "sharedav")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Serve the shares from ~/.config/sharedav/config.toml
    sharedav serve

    # Serve on all interfaces with an explicit config file
    sharedav serve --config /etc/sharedav.toml --listen 0.0.0.0:8080

    # Check a config file and list its shares
    sharedav shares --config /etc/sharedav.toml

    # Serve two directories as the current user (what user servers run)
    sharedav serve-shares docs ~/Documents photos ~/Pictures
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the configured shares to remote peers
    Serve(serve::Args),

    /// Serve NAME PATH pairs over WebDAV and print the listen address
    #[command(name = "serve-shares")]
    ServeShares(serve_shares::Args),

    /// Validate the configuration and list its shares
    Shares(shares::Args),
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS),
        Err(e) => {
            let code = categorize_error(&e);

            let args: Vec<String> = std::env::args().collect();
            let is_quiet = args.iter().any(|a| a == "-q" || a == "--quiet");

            if !is_quiet {
                eprintln!("Error: {e:#}");
            }

            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if !cli.quiet {
        setup_tracing(cli.verbose);
    }

    match cli.command {
        Commands::Shares(args) => shares::execute(&args),
        Commands::Serve(args) => runtime()?.block_on(serve::execute(&args)),
        Commands::ServeShares(args) => runtime()?.block_on(serve_shares::execute(args)),
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")
}

/// Logs always go to stderr: a user server's stdout carries its address.
fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Console layer listens on TOKIO_CONSOLE_BIND (default 127.0.0.1:6669).
    #[cfg(feature = "tokio-console")]
    {
        use tracing_subscriber::Layer;

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()));
        tracing_subscriber::registry()
            .with(console_subscriber::spawn())
            .with(fmt_layer)
            .init();
    }

    #[cfg(not(feature = "tokio-console"))]
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(io::stderr)
        .init();
}

/// Categorize an error into an exit code using typed error downcasting
fn categorize_error(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(config_err) = cause.downcast_ref::<ConfigError>() {
            return match config_err {
                ConfigError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                    exit_code::NOT_FOUND
                }
                ConfigError::Io { source, .. }
                    if source.kind() == io::ErrorKind::PermissionDenied =>
                {
                    exit_code::PERMISSION_DENIED
                }
                _ => exit_code::CONFIG_INVALID,
            };
        }

        if let Some(server_err) = cause.downcast_ref::<ServerError>() {
            match server_err {
                ServerError::Bind { source, .. } => match source.kind() {
                    io::ErrorKind::AddrInUse => return exit_code::ADDRESS_IN_USE,
                    io::ErrorKind::PermissionDenied => return exit_code::PERMISSION_DENIED,
                    _ => {}
                },
                ServerError::NotADirectory { .. } => return exit_code::NOT_FOUND,
                ServerError::LocalAddr(_) => {}
            }
        }

        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::PermissionDenied => return exit_code::PERMISSION_DENIED,
                io::ErrorKind::NotFound => return exit_code::NOT_FOUND,
                io::ErrorKind::Interrupted => return exit_code::CANCELLED,
                _ => {}
            }
        }
    }

    exit_code::GENERAL_ERROR
}
