//! Shares command - validate the configuration and list its shares.
//!
//! # Examples
//!
//! ```bash
//! # Table grouped by owner
//! sharedav shares --config /etc/sharedav.toml
//!
//! # JSON for scripting
//! sharedav shares --json
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Args as ClapArgs;
use comfy_table::{Cell, Color, Table};
use tracing::instrument;

use sharedav::{Config, Permission, Permissions};

use crate::config;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Configuration file [default: platform config dir]
    #[arg(short, long, env = "SHAREDAV_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[instrument(level = "info", name = "cmd::shares", skip_all)]
pub fn execute(args: &Args) -> Result<()> {
    let path = config::resolve(args.config.as_deref())?;
    let cfg = config::load(&path)?;

    if args.json {
        output_json(&cfg)?;
        return Ok(());
    }

    if cfg.shares.is_empty() {
        eprintln!("No shares configured in {}.", path.display());
        return Ok(());
    }

    output_table(&cfg);
    eprintln!();
    eprintln!(
        "{} share(s), {} owner(s)",
        cfg.shares.len(),
        cfg.shares_by_owner().len()
    );
    Ok(())
}

fn output_table(cfg: &Config) {
    let mut table = Table::new();
    table.set_header(vec!["Owner", "Share", "Path", "Access"]);

    for (owner, shares) in cfg.shares_by_owner() {
        for share in shares {
            let permission = cfg.permissions.for_share(&share.name);
            let access_cell = Cell::new(permission).fg(match permission {
                Permission::None => Color::DarkGrey,
                Permission::ReadOnly => Color::Yellow,
                Permission::ReadWrite => Color::Green,
            });
            table.add_row(vec![
                Cell::new(owner),
                Cell::new(&share.name),
                Cell::new(share.path.display()),
                access_cell,
            ]);
        }
    }

    println!("{table}");
}

fn output_json(cfg: &Config) -> Result<()> {
    let shares: Vec<serde_json::Value> = cfg
        .shares
        .iter()
        .map(|share| {
            serde_json::json!({
                "name": share.name,
                "path": share.path,
                "as": share.as_user,
                "access": cfg.permissions.for_share(&share.name).to_string(),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "shares": shares }))?);
    Ok(())
}
