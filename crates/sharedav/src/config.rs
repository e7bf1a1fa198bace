//! TOML configuration.
//!
//! ```toml
//! [server]
//! bind_address = "127.0.0.1"
//! port = 8080
//!
//! [supervisor]
//! privilege_separation = true
//! probe_timeout = "3s"
//!
//! [supervisor.backoff]
//! base = "1ms"
//! max = "30s"
//!
//! [[share]]
//! name = "docs"
//! path = "/home/alice/Documents"
//! as = "alice"
//!
//! [permissions]
//! default = "ro"
//! docs = "rw"
//! ```

use crate::backoff::BackoffConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::privilege::{PrivilegeDropLauncher, DEFAULT_PROBE_TIMEOUT};
use crate::remote::RemoteOptions;
use crate::server::ServerConfig;
use crate::share::{normalize_share_name, Share, StaticPermissions};
use crate::user_server::{SupervisorOptions, SERVE_SUBCOMMAND};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// User server supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Run each owner's shares in a process running as that owner.
    pub privilege_separation: bool,
    /// Executable to start instead of the current one.
    pub executable: Option<PathBuf>,
    /// sudo binary used to switch users.
    pub sudo: PathBuf,
    /// Upper bound for the sudo capability probe.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Restart backoff.
    pub backoff: BackoffConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            privilege_separation: cfg!(unix),
            executable: None,
            sudo: PathBuf::from("sudo"),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Front endpoint listener.
    pub server: ServerConfig,
    /// User server supervision.
    pub supervisor: SupervisorConfig,
    /// Shares, in file order.
    #[serde(rename = "share")]
    pub shares: Vec<Share>,
    /// Permissions granted to remote principals.
    pub permissions: StaticPermissions,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(text)?;
        config.validated()
    }

    /// Normalize share names and check shares for consistency.
    ///
    /// Permission entries are keyed by normalized names as well.
    pub fn validated(mut self) -> ConfigResult<Self> {
        let mut seen = HashSet::new();
        let mut shares = Vec::with_capacity(self.shares.len());
        for share in self.shares {
            let share = share.normalized()?;
            if !seen.insert(share.name.clone()) {
                return Err(ConfigError::DuplicateShare(share.name));
            }
            shares.push(share);
        }
        self.shares = shares;

        let mut permissions = HashMap::with_capacity(self.permissions.shares.len());
        for (name, permission) in self.permissions.shares {
            permissions.insert(normalize_share_name(&name)?, permission);
        }
        self.permissions.shares = permissions;
        Ok(self)
    }

    /// Options for the share coordinator.
    pub fn remote_options(&self) -> RemoteOptions {
        let launcher = PrivilegeDropLauncher::new()
            .with_sudo(self.supervisor.sudo.clone())
            .with_probe_timeout(self.supervisor.probe_timeout);
        RemoteOptions {
            privilege_separation: self.supervisor.privilege_separation,
            executable: self.supervisor.executable.clone(),
            supervisor: SupervisorOptions {
                backoff: self.supervisor.backoff,
                subcommand: SERVE_SUBCOMMAND.to_string(),
                launcher: Arc::new(launcher),
            },
        }
    }

    /// Shares grouped by owner, both in name order.
    pub fn shares_by_owner(&self) -> BTreeMap<&str, Vec<&Share>> {
        let mut owners: BTreeMap<&str, Vec<&Share>> = BTreeMap::new();
        for share in &self.shares {
            owners.entry(share.as_user.as_str()).or_default().push(share);
        }
        for shares in owners.values_mut() {
            shares.sort_by(|a, b| a.name.cmp(&b.name));
        }
        owners
    }
}
