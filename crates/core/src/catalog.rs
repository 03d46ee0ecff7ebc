use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::SnapshotId;

/// Lightweight index entry for a completed snapshot.
///
/// Kept apart from the full snapshot blob so listings never load results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: SnapshotId,
    pub descriptor: String,
    /// `stage == end && error.is_none()` at commit time.
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}
