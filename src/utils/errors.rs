//! Custom error types for the snapshot tool.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Invalid retention setting: {0}")]
    InvalidRetention(String),

    #[error("action '{event}' failed for '{}' (timed out: {timed_out})", .path.display())]
    ActionFailed {
        event: &'static str,
        path: PathBuf,
        timed_out: bool,
    },

    #[error("snapshot path redirected to missing directory '{}'", .0.display())]
    RedirectTargetMissing(PathBuf),

    #[error("Failed to persist action script: {0}")]
    ScriptPersistence(String),

    #[error("Snapshot cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, VaultError>;
