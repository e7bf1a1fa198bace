//! Shares and share-level permissions.

use crate::error::{ConfigError, ConfigResult};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A named local directory exposed to remote principals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// Unique share name, also the first path segment of requests.
    pub name: String,
    /// Local directory served under the share.
    pub path: PathBuf,
    /// Local account the share is served as.
    #[serde(rename = "as")]
    pub as_user: String,
}

impl Share {
    /// Create a share.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, as_user: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            as_user: as_user.into(),
        }
    }

    /// Normalize the name and validate the share.
    pub fn normalized(mut self) -> ConfigResult<Self> {
        self.name = normalize_share_name(&self.name)?;
        if !self.path.is_absolute() {
            return Err(ConfigError::RelativePath {
                name: self.name,
                path: self.path,
            });
        }
        if self.as_user.trim().is_empty() {
            return Err(ConfigError::MissingOwner(self.name));
        }
        Ok(self)
    }
}

/// Normalize a share name: trim surrounding whitespace and lower-case it.
///
/// Allowed characters after normalization are ASCII letters and digits,
/// `_`, `-`, `(`, `)` and inner spaces.
pub fn normalize_share_name(name: &str) -> ConfigResult<String> {
    let name = name.trim().to_lowercase();
    if name.is_empty() || !name.chars().all(is_share_name_char) {
        return Err(ConfigError::InvalidShareName(name));
    }
    Ok(name)
}

fn is_share_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '(' | ')' | ' ')
}

/// Access a remote principal has to one share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Permission {
    /// The share is invisible.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Read methods only.
    #[serde(rename = "ro", alias = "read-only", alias = "readonly")]
    ReadOnly,
    /// All methods.
    #[serde(rename = "rw", alias = "read-write", alias = "readwrite")]
    ReadWrite,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Permission::None => "none",
            Permission::ReadOnly => "ro",
            Permission::ReadWrite => "rw",
        })
    }
}

/// Share-level access decision for the principal making a request.
pub trait Permissions: Send + Sync {
    /// Permission on the named share.
    fn for_share(&self, share_name: &str) -> Permission;
}

impl<F> Permissions for F
where
    F: Fn(&str) -> Permission + Send + Sync,
{
    fn for_share(&self, share_name: &str) -> Permission {
        self(share_name)
    }
}

impl Permissions for HashMap<String, Permission> {
    fn for_share(&self, share_name: &str) -> Permission {
        self.get(share_name).copied().unwrap_or_default()
    }
}

/// Reloadable policy: every lookup reads the currently stored policy.
impl<P: Permissions> Permissions for ArcSwap<P> {
    fn for_share(&self, share_name: &str) -> Permission {
        self.load().for_share(share_name)
    }
}

/// Fixed per-share permissions with a fallback for unlisted shares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPermissions {
    /// Permission for shares without an explicit entry.
    #[serde(default)]
    pub default: Permission,
    /// Explicit per-share permissions.
    #[serde(flatten)]
    pub shares: HashMap<String, Permission>,
}

impl StaticPermissions {
    /// Permissions granting `default` to every share.
    pub fn uniform(default: Permission) -> Self {
        Self {
            default,
            shares: HashMap::new(),
        }
    }

    /// Add an explicit entry.
    #[must_use]
    pub fn with_share(mut self, name: impl Into<String>, permission: Permission) -> Self {
        self.shares.insert(name.into(), permission);
        self
    }
}

impl Permissions for StaticPermissions {
    fn for_share(&self, share_name: &str) -> Permission {
        self.shares.get(share_name).copied().unwrap_or(self.default)
    }
}
