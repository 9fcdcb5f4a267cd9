//! Repository configuration.
//!
//! Stored as a TOML file inside the repository directory, written at
//! creation time and read back on every open.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::errors::{Result, VaultError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Host snapshots created through this repository are attributed to
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// User snapshots are attributed to
    #[serde(default = "default_username")]
    pub username: String,

    /// Repository-level default for running snapshot actions
    #[serde(default)]
    pub enable_actions: bool,
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            hostname: default_hostname(),
            username: default_username(),
            enable_actions: false,
        }
    }
}

impl RepoConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| VaultError::Config(format!("invalid repository config: {e}")))
    }

    /// Write configuration back to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VaultError::Config(format!("cannot serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
