//! Per-path snapshot policies.
//!
//! A policy carries action bindings for the four lifecycle events plus
//! retention caps, addressed by filesystem path. Root-event bindings and
//! retention caps inherit along the directory-prefix chain with
//! nearest-ancestor override; folder-event bindings apply only to the exact
//! directory they are set on.

pub mod retention;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::actions::{ActionCommand, ActionEvent};
use crate::utils::errors::Result;
pub use retention::RetentionPolicy;

/// Action bindings for the four lifecycle events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionsPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_snapshot_root: Option<ActionCommand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_snapshot_root: Option<ActionCommand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_folder: Option<ActionCommand>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_folder: Option<ActionCommand>,
}

impl ActionsPolicy {
    /// Adopt the parent's root-event bindings where unset.
    ///
    /// Folder bindings apply only to the directory they are set on and
    /// never travel up the chain.
    fn merge_from(&mut self, parent: &ActionsPolicy) {
        if self.before_snapshot_root.is_none() {
            self.before_snapshot_root = parent.before_snapshot_root.clone();
        }
        if self.after_snapshot_root.is_none() {
            self.after_snapshot_root = parent.after_snapshot_root.clone();
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn get(&self, event: ActionEvent) -> Option<&ActionCommand> {
        match event {
            ActionEvent::BeforeSnapshotRoot => self.before_snapshot_root.as_ref(),
            ActionEvent::AfterSnapshotRoot => self.after_snapshot_root.as_ref(),
            ActionEvent::BeforeFolder => self.before_folder.as_ref(),
            ActionEvent::AfterFolder => self.after_folder.as_ref(),
        }
    }

    pub fn set(&mut self, event: ActionEvent, binding: ActionCommand) {
        match event {
            ActionEvent::BeforeSnapshotRoot => self.before_snapshot_root = Some(binding),
            ActionEvent::AfterSnapshotRoot => self.after_snapshot_root = Some(binding),
            ActionEvent::BeforeFolder => self.before_folder = Some(binding),
            ActionEvent::AfterFolder => self.after_folder = Some(binding),
        }
    }
}

/// Policy record addressed by a filesystem path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default, skip_serializing_if = "ActionsPolicy::is_empty")]
    pub actions: ActionsPolicy,

    #[serde(default, skip_serializing_if = "RetentionPolicy::is_empty")]
    pub retention: RetentionPolicy,
}

impl Policy {
    fn merge_from(&mut self, parent: &Policy) {
        self.actions.merge_from(&parent.actions);
        self.retention.merge_from(&parent.retention);
    }
}

/// Maps filesystem paths to policies and resolves them over the tree.
///
/// Read-only during a snapshot attempt; persisted as a JSON object keyed
/// by path.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: BTreeMap<PathBuf, Policy>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the path → policy map; a missing file is an empty store.
    pub fn load(file: &Path) -> Result<Self> {
        if !file.exists() {
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(file)?;
        let policies = serde_json::from_str(&content)?;
        Ok(Self { policies })
    }

    pub fn save(&self, file: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.policies)?;
        std::fs::write(file, content)?;
        Ok(())
    }

    /// Install a policy for `path`, validating its retention caps.
    pub fn set(&mut self, path: &Path, policy: Policy) -> Result<()> {
        policy.retention.validate()?;
        self.policies.insert(path.to_path_buf(), policy);
        Ok(())
    }

    /// The policy defined exactly on `path`, if any.
    pub fn defined(&self, path: &Path) -> Option<&Policy> {
        self.policies.get(path)
    }

    /// Effective policy for `path`: nearest-ancestor override for
    /// root-event bindings, field-wise retention inheritance, finished with
    /// the built-in retention defaults.
    pub fn effective(&self, path: &Path) -> Policy {
        let mut resolved = self.defined(path).cloned().unwrap_or_default();
        for ancestor in path.ancestors().skip(1) {
            if let Some(parent) = self.policies.get(ancestor) {
                resolved.merge_from(parent);
            }
        }
        resolved.retention.merge_from(&RetentionPolicy::default_caps());
        resolved
    }

    /// Binding for a root event, resolved with inheritance.
    pub fn root_action(&self, path: &Path, event: ActionEvent) -> Option<ActionCommand> {
        debug_assert!(event.is_root());
        self.effective(path).actions.get(event).cloned()
    }

    /// Binding for a folder event; only an exact match applies.
    pub fn folder_action(&self, path: &Path, event: ActionEvent) -> Option<&ActionCommand> {
        debug_assert!(!event.is_root());
        self.defined(path).and_then(|p| p.actions.get(event))
    }
}
