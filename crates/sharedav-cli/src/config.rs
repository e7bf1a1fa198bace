//! Locating and loading the configuration file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sharedav::Config;

/// Default configuration file in the platform config directory.
pub fn default_path() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("com", "sharedav", "sharedav")
        .context("Could not determine config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

/// The explicit path, or the default one.
pub fn resolve(path: Option<&Path>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => default_path(),
    }
}

/// Load and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}
