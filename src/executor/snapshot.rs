/*!
 * Snapshot Listing
 * Parsed form of the backup tool's `snapshots --json` output
 */

use crate::core::errors::ExecError;
use crate::core::types::ExecResult;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SnapshotDescriptor {
    /// Short id, falling back to the first eight characters of the id
    pub fn display_id(&self) -> &str {
        if self.short_id.is_empty() {
            self.id.get(..8).unwrap_or(&self.id)
        } else {
            &self.short_id
        }
    }
}

/// Parse a snapshot listing; blank output and `null` mean no snapshots
pub fn parse_snapshots(stdout: &str) -> ExecResult<Vec<SnapshotDescriptor>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let mut snapshots: Vec<SnapshotDescriptor> = serde_json::from_str(trimmed)
        .map_err(|e| ExecError::Protocol(format!("unreadable snapshot listing: {e}")))?;
    snapshots.sort_by(|a, b| a.time.cmp(&b.time));
    Ok(snapshots)
}
