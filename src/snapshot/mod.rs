//! Snapshot manifests and the identity they record.

pub mod driver;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::ObjectId;

/// Identity of what a snapshot captured and on whose behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub host: String,
    pub user_name: String,
    pub path: PathBuf,
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}",
            self.user_name,
            self.host,
            self.path.display()
        )
    }
}

/// Immutable record of one snapshot attempt.
///
/// Only `retention_reasons` is ever rewritten after creation, by the
/// retention engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Unique per attempt, even for repeated snapshots of the same source
    pub id: String,

    pub source: SourceInfo,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    /// Content-derived identifier of the captured tree
    pub root_object: ObjectId,

    pub total_files: usize,

    pub total_bytes: u64,

    /// Non-empty when the attempt did not capture everything
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_reason: Option<String>,

    /// Why this snapshot is kept; stamped by the retention engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retention_reasons: Vec<String>,
}

impl Manifest {
    pub fn is_complete(&self) -> bool {
        self.incomplete_reason.as_deref().map_or(true, str::is_empty)
    }
}

/// Newest-first ordering used by listings and the retention engine.
pub fn sort_by_time_desc(manifests: &mut [Manifest]) {
    manifests.sort_by(|a, b| b.start_time.cmp(&a.start_time));
}
