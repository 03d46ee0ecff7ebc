//! Snapshot persistence.
//!
//! ## Layout
//!
//! - one **active slot** holding the job currently being computed
//! - a **catalog** of lightweight descriptors for completed jobs
//! - one **blob** per completed job with the full serialized snapshot
//!
//! Listings only read the catalog; blobs are loaded on demand.
//!
//! ## Concurrency
//!
//! Stores follow a single-writer discipline: every mutation happens under the
//! store's own lock, and [`SnapshotStore::claim_active`] is the only way to
//! fill an empty active slot (check-and-set).

pub mod fs;
pub mod memory;

use std::sync::Arc;

use tracing::warn;

use enrollsnap_core::{CatalogEntry, Snapshot, SnapshotId};

pub use fs::FsSnapshotStore;
pub use memory::InMemorySnapshotStore;

/// Snapshot store abstraction.
pub trait SnapshotStore: Send + Sync {
    /// Overwrite the active slot.
    fn save_active(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Load the active job, if any.
    fn load_active(&self) -> Result<Option<Snapshot>, StoreError>;

    /// Empty the active slot. No-op if already empty.
    fn clear_active(&self) -> Result<(), StoreError>;

    /// Fill the active slot only if it is empty.
    ///
    /// Returns `false` (and writes nothing) when another job is active.
    fn claim_active(&self, snapshot: &Snapshot) -> Result<bool, StoreError>;

    /// Upsert the catalog descriptor and store the full blob.
    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Remove a catalog entry and its blob. No-op if absent.
    fn delete(&self, id: &SnapshotId) -> Result<(), StoreError>;

    /// Load a completed snapshot.
    fn get(&self, id: &SnapshotId) -> Result<Option<Snapshot>, StoreError>;

    /// Catalog entries ordered by creation time.
    ///
    /// Entries whose blob is missing are skipped.
    fn list(&self, only_valid: bool) -> Result<Vec<CatalogEntry>, StoreError>;
}

/// Snapshot store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Decode the raw active slot.
///
/// A blank slot or a descriptor without an id counts as empty: it can never
/// be resumed, and treating it as occupied would block every future job. A
/// descriptor that still names its id is never dropped; when its body cannot
/// be decoded it comes back with an unknown stage so the scheduler fails it
/// into the catalog.
pub(crate) fn decode_active(raw: &str) -> Option<Snapshot> {
    if raw.trim().is_empty() {
        return None;
    }
    match Snapshot::from_json(raw) {
        Ok(snapshot) if !snapshot.id().is_blank() => Some(snapshot),
        Ok(_) => {
            warn!("active snapshot slot has no id; treating it as empty");
            None
        }
        Err(err) => match Snapshot::salvage(raw) {
            Some(snapshot) => {
                warn!(snapshot_id = %snapshot.id(), error = %err, "active snapshot is corrupt; keeping it for failure");
                Some(snapshot)
            }
            None => {
                warn!(error = %err, "active snapshot slot is unreadable; treating it as empty");
                None
            }
        },
    }
}

/// Order catalog entries for listing.
pub(crate) fn sort_catalog(entries: &mut [CatalogEntry]) {
    entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

impl<T: SnapshotStore + ?Sized> SnapshotStore for Arc<T> {
    fn save_active(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        (**self).save_active(snapshot)
    }

    fn load_active(&self) -> Result<Option<Snapshot>, StoreError> {
        (**self).load_active()
    }

    fn clear_active(&self) -> Result<(), StoreError> {
        (**self).clear_active()
    }

    fn claim_active(&self, snapshot: &Snapshot) -> Result<bool, StoreError> {
        (**self).claim_active(snapshot)
    }

    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        (**self).commit(snapshot)
    }

    fn delete(&self, id: &SnapshotId) -> Result<(), StoreError> {
        (**self).delete(id)
    }

    fn get(&self, id: &SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        (**self).get(id)
    }

    fn list(&self, only_valid: bool) -> Result<Vec<CatalogEntry>, StoreError> {
        (**self).list(only_valid)
    }
}
