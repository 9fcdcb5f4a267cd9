//! Content addressing for captured directory trees.
//!
//! An [`ObjectId`] is a pure function of captured content: two trees with
//! identical entry names and file bytes produce identical identifiers, no
//! matter when or from where they were captured.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque content-derived identifier. Equality implies byte-identical
/// captured content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental digest over one directory's entries.
///
/// Entries must be fed in a deterministic order; the capture engine feeds
/// them sorted by name. Files contribute their content digest, child
/// directories their own finished [`ObjectId`]. Length prefixes keep the
/// encoding unambiguous.
#[derive(Debug, Default)]
pub struct TreeDigest {
    hasher: Sha256,
}

impl TreeDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: &str, content_digest: &[u8], size: u64) {
        self.hasher.update(b"F");
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update(size.to_le_bytes());
        self.hasher.update(content_digest);
    }

    pub fn add_dir(&mut self, name: &str, child: &ObjectId) {
        self.hasher.update(b"D");
        self.hasher.update((name.len() as u64).to_le_bytes());
        self.hasher.update(name.as_bytes());
        self.hasher.update(child.as_str().as_bytes());
    }

    pub fn finish(self) -> ObjectId {
        ObjectId(hex::encode(self.hasher.finalize()))
    }
}

/// Digest a single file's contents without loading it into memory.
///
/// Returns the content digest and the file size in bytes.
pub fn hash_file(path: &Path) -> std::io::Result<(Vec<u8>, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((hasher.finalize().to_vec(), size))
}
