//! On-disk repository: configuration, policies, and the manifest log.
//!
//! Layout under the repository directory:
//! - `config.toml` - repository configuration, written at creation
//! - `policies.json` - path to policy map
//! - `manifests.json` - list of snapshot manifests

use std::path::{Path, PathBuf};

use tracing::info;

use crate::clock::Clock;
use crate::config::RepoConfig;
use crate::policy::PolicyStore;
use crate::snapshot::{self, Manifest};
use crate::utils::errors::{Result, VaultError};

const CONFIG_FILE: &str = "config.toml";
const POLICIES_FILE: &str = "policies.json";
const MANIFESTS_FILE: &str = "manifests.json";

pub struct Repository {
    root: PathBuf,
    pub config: RepoConfig,
    pub policies: PolicyStore,
    manifests: Vec<Manifest>,
}

impl Repository {
    /// Initialize a new repository directory.
    pub fn create(root: &Path, enable_actions: bool) -> Result<Self> {
        if root.join(CONFIG_FILE).exists() {
            return Err(VaultError::Repository(format!(
                "repository already exists at {}",
                root.display()
            )));
        }
        std::fs::create_dir_all(root)?;

        let config = RepoConfig {
            enable_actions,
            ..RepoConfig::default()
        };
        config.save(&root.join(CONFIG_FILE))?;

        info!(
            "created repository at {} (actions enabled: {})",
            root.display(),
            enable_actions
        );

        Ok(Self {
            root: root.to_path_buf(),
            config,
            policies: PolicyStore::new(),
            manifests: Vec::new(),
        })
    }

    /// Open an existing repository directory.
    pub fn open(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(VaultError::Repository(format!(
                "no repository at {}",
                root.display()
            )));
        }

        let config = RepoConfig::from_file(&config_path)?;
        let policies = PolicyStore::load(&root.join(POLICIES_FILE))?;
        let manifests = load_manifests(&root.join(MANIFESTS_FILE))?;

        Ok(Self {
            root: root.to_path_buf(),
            config,
            policies,
            manifests,
        })
    }

    /// Persist configuration, policies and manifests.
    pub fn save(&self) -> Result<()> {
        self.config.save(&self.root.join(CONFIG_FILE))?;
        self.policies.save(&self.root.join(POLICIES_FILE))?;
        let content = serde_json::to_string_pretty(&self.manifests)?;
        std::fs::write(self.root.join(MANIFESTS_FILE), content)?;
        Ok(())
    }

    pub fn add_manifest(&mut self, manifest: Manifest) {
        self.manifests.push(manifest);
    }

    /// Manifests of one source, newest first.
    pub fn snapshots_for(&self, source: &Path) -> Vec<Manifest> {
        let mut list: Vec<Manifest> = self
            .manifests
            .iter()
            .filter(|m| m.source.path == source)
            .cloned()
            .collect();
        snapshot::sort_by_time_desc(&mut list);
        list
    }

    /// Recompute retention reasons for all manifests of `source` using the
    /// effective policy, and store them back.
    pub fn apply_retention(&mut self, source: &Path, clock: &dyn Clock) {
        let retention = self.policies.effective(source).retention;

        let indices: Vec<usize> = self
            .manifests
            .iter()
            .enumerate()
            .filter(|(_, m)| m.source.path == source)
            .map(|(i, _)| i)
            .collect();

        let mut subset: Vec<Manifest> = indices
            .iter()
            .map(|&i| self.manifests[i].clone())
            .collect();
        retention.compute_retention_reasons(&mut subset, clock);

        for (slot, manifest) in indices.into_iter().zip(subset) {
            self.manifests[slot] = manifest;
        }
    }
}

fn load_manifests(path: &Path) -> Result<Vec<Manifest>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
