//! Snapshot lifecycle actions.
//!
//! An action is a user-supplied command or script invoked at a defined
//! point in the snapshot lifecycle. Bindings live in policy; this module
//! defines their shape, the lifecycle events, and the gate that decides
//! whether actions run at all for an attempt.

pub mod runner;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wait bound for synchronous actions with no explicit timeout.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// How an action's outcome influences the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    /// Failure aborts the snapshot (default).
    #[default]
    Essential,
    /// Failure is logged and ignored.
    Optional,
    /// Spawn and detach; the outcome is never observed.
    Async,
}

impl ActionMode {
    /// Synchronous modes wait for the child and parse its stdout.
    pub fn is_sync(self) -> bool {
        !matches!(self, Self::Async)
    }
}

impl FromStr for ActionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "essential" => Ok(Self::Essential),
            "optional" => Ok(Self::Optional),
            "async" => Ok(Self::Async),
            other => Err(format!(
                "unknown action mode '{other}' (expected essential, optional or async)"
            )),
        }
    }
}

impl fmt::Display for ActionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Essential => "essential",
            Self::Optional => "optional",
            Self::Async => "async",
        })
    }
}

/// Lifecycle point an action is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionEvent {
    BeforeSnapshotRoot,
    AfterSnapshotRoot,
    BeforeFolder,
    AfterFolder,
}

impl ActionEvent {
    /// Wire name passed to the child via `KOPIA_ACTION`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeSnapshotRoot => "before-snapshot-root",
            Self::AfterSnapshotRoot => "after-snapshot-root",
            Self::BeforeFolder => "before-folder",
            Self::AfterFolder => "after-folder",
        }
    }

    /// Root events resolve through policy inheritance; folder events apply
    /// only to the directory they are set on.
    pub fn is_root(self) -> bool {
        matches!(self, Self::BeforeSnapshotRoot | Self::AfterSnapshotRoot)
    }
}

impl fmt::Display for ActionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action binding persisted in policy.
///
/// Exactly one of `command` / `script` is expected to be set: either an
/// external command line, or an inline script body embedded into the policy
/// so the action survives loss of the original file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    /// External command line, split on whitespace (no shell quoting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Inline script body persisted with the policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    /// Wall-clock timeout in seconds; 0 or absent selects the engine default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub mode: ActionMode,
}

impl ActionCommand {
    pub fn external(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            script: None,
            timeout_secs: None,
            mode: ActionMode::Essential,
        }
    }

    pub fn persisted_script(body: impl Into<String>) -> Self {
        Self {
            command: None,
            script: Some(body.into()),
            timeout_secs: None,
            mode: ActionMode::Essential,
        }
    }

    pub fn with_mode(mut self, mode: ActionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Effective wait bound: the explicit setting, or 15 minutes for
    /// synchronous modes. Asynchronous actions are never waited on.
    pub fn effective_timeout(&self) -> Option<Duration> {
        if !self.mode.is_sync() {
            return None;
        }
        match self.timeout_secs {
            Some(0) | None => Some(DEFAULT_SYNC_TIMEOUT),
            Some(secs) => Some(Duration::from_secs(secs)),
        }
    }
}

/// Decide whether actions run for this snapshot attempt.
///
/// The per-invocation override, when present, takes absolute precedence;
/// otherwise the repository-level default applies.
pub fn actions_enabled(repo_default: bool, invocation_override: Option<bool>) -> bool {
    invocation_override.unwrap_or(repo_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_gate_matrix() {
        // (repository default, invocation override) -> actions run
        let cases = [
            (false, None, false),
            (true, None, true),
            (false, Some(true), true),
            (false, Some(false), false),
            (true, Some(false), false),
            (true, Some(true), true),
        ];
        for (repo, invocation, want) in cases {
            assert_eq!(
                actions_enabled(repo, invocation),
                want,
                "repo={repo} invocation={invocation:?}"
            );
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("essential".parse::<ActionMode>().unwrap(), ActionMode::Essential);
        assert_eq!("optional".parse::<ActionMode>().unwrap(), ActionMode::Optional);
        assert_eq!("async".parse::<ActionMode>().unwrap(), ActionMode::Async);
        assert!("background".parse::<ActionMode>().is_err());
    }

    #[test]
    fn test_effective_timeout_defaults() {
        let essential = ActionCommand::external("/bin/true");
        assert_eq!(essential.effective_timeout(), Some(DEFAULT_SYNC_TIMEOUT));

        let zero = ActionCommand::external("/bin/true").with_timeout(Duration::ZERO);
        assert_eq!(zero.effective_timeout(), Some(DEFAULT_SYNC_TIMEOUT));

        let explicit = ActionCommand::external("/bin/true").with_timeout(Duration::from_secs(3));
        assert_eq!(explicit.effective_timeout(), Some(Duration::from_secs(3)));

        let detached = ActionCommand::external("/bin/true").with_mode(ActionMode::Async);
        assert_eq!(detached.effective_timeout(), None);
    }

    #[test]
    fn test_binding_serde_roundtrip() {
        let binding = ActionCommand::persisted_script("#!/bin/sh\nexit 0")
            .with_mode(ActionMode::Optional)
            .with_timeout(Duration::from_secs(3));
        let json = serde_json::to_string(&binding).unwrap();
        let back: ActionCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, binding);
        // external command stays absent rather than round-tripping as null
        assert!(!json.contains("command"));
    }
}
