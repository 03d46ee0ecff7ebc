//! In-memory snapshot store for tests/dev.
//!
//! Snapshots are kept as serialized JSON, exactly as a durable store would
//! hold them, so every load goes through the wire format.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use tracing::debug;

use enrollsnap_core::{CatalogEntry, Snapshot, SnapshotId};

use super::{SnapshotStore, StoreError, decode_active, sort_catalog};

#[derive(Debug, Default)]
struct Slots {
    active: Option<String>,
    catalog: BTreeMap<SnapshotId, CatalogEntry>,
    blobs: HashMap<SnapshotId, String>,
}

/// In-memory snapshot store.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    slots: RwLock<Slots>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Raw JSON currently held in the active slot.
    pub fn raw_active(&self) -> Result<Option<String>, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(slots.active.clone())
    }

    /// Overwrite the active slot with arbitrary JSON (e.g. a descriptor written by an older version).
    pub fn put_raw_active(&self, raw: impl Into<String>) -> Result<(), StoreError> {
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        slots.active = Some(raw.into());
        Ok(())
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save_active(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let raw = snapshot.to_json()?;
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        slots.active = Some(raw);
        Ok(())
    }

    fn load_active(&self) -> Result<Option<Snapshot>, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::Poisoned)?;
        Ok(slots.active.as_deref().and_then(decode_active))
    }

    fn clear_active(&self) -> Result<(), StoreError> {
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        slots.active = None;
        Ok(())
    }

    fn claim_active(&self, snapshot: &Snapshot) -> Result<bool, StoreError> {
        let raw = snapshot.to_json()?;
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        if slots.active.as_deref().and_then(decode_active).is_some() {
            return Ok(false);
        }
        slots.active = Some(raw);
        Ok(true)
    }

    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let raw = snapshot.to_json()?;
        let entry = snapshot.catalog_entry();
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        slots.catalog.insert(entry.id.clone(), entry);
        slots.blobs.insert(snapshot.id().clone(), raw);
        debug!(snapshot_id = %snapshot.id(), "snapshot committed to catalog");
        Ok(())
    }

    fn delete(&self, id: &SnapshotId) -> Result<(), StoreError> {
        let mut slots = self.slots.write().map_err(|_| StoreError::Poisoned)?;
        slots.catalog.remove(id);
        slots.blobs.remove(id);
        Ok(())
    }

    fn get(&self, id: &SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::Poisoned)?;
        if !slots.catalog.contains_key(id) {
            return Ok(None);
        }
        match slots.blobs.get(id) {
            Some(raw) => Ok(Some(Snapshot::from_json(raw)?)),
            None => Ok(None),
        }
    }

    fn list(&self, only_valid: bool) -> Result<Vec<CatalogEntry>, StoreError> {
        let slots = self.slots.read().map_err(|_| StoreError::Poisoned)?;
        let mut entries: Vec<_> = slots
            .catalog
            .values()
            .filter(|e| !only_valid || e.is_valid)
            .filter(|e| slots.blobs.contains_key(&e.id))
            .cloned()
            .collect();
        sort_catalog(&mut entries);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use enrollsnap_core::EnvironmentTags;

    use super::*;

    fn completed(name: &str, valid: bool) -> Snapshot {
        let mut snapshot = Snapshot::start(Some(name.to_string()), false);
        snapshot
            .initialize(0, 0, EnvironmentTags::engine("3.0.0"))
            .unwrap();
        if !valid {
            snapshot.fail("An unknown error occurred.").unwrap();
        }
        snapshot.finish();
        snapshot
    }

    #[test]
    fn claim_is_single_flight() {
        let store = InMemorySnapshotStore::new();
        let first = Snapshot::start(Some("first".to_string()), false);
        let second = Snapshot::start(Some("second".to_string()), false);

        assert!(store.claim_active(&first).unwrap());
        assert!(!store.claim_active(&second).unwrap());
        assert_eq!(store.load_active().unwrap().unwrap().id(), first.id());

        store.clear_active().unwrap();
        assert!(store.claim_active(&second).unwrap());
    }

    #[test]
    fn blank_or_corrupt_active_slot_counts_as_empty() {
        let store = InMemorySnapshotStore::new();
        store.put_raw_active("{\"stage\":\"process\"}").unwrap();
        assert!(store.load_active().unwrap().is_none());

        store.put_raw_active("not json").unwrap();
        assert!(store.load_active().unwrap().is_none());
        assert!(store.claim_active(&Snapshot::start(None, false)).unwrap());
    }

    #[test]
    fn catalog_is_ordered_and_filterable() {
        let store = InMemorySnapshotStore::new();
        let a = completed("a", true);
        thread::sleep(Duration::from_millis(2));
        let b = completed("b", false);
        thread::sleep(Duration::from_millis(2));
        let c = completed("c", true);

        store.commit(&c).unwrap();
        store.commit(&a).unwrap();
        store.commit(&b).unwrap();

        let all: Vec<_> = store.list(false).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(all, vec![a.id().clone(), b.id().clone(), c.id().clone()]);

        let valid: Vec<_> = store.list(true).unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(valid, vec![a.id().clone(), c.id().clone()]);

        assert_eq!(store.get(b.id()).unwrap().as_ref(), Some(&b));
    }

    #[test]
    fn listing_skips_entries_with_missing_blobs() {
        let store = InMemorySnapshotStore::new();
        let a = completed("a", true);
        store.commit(&a).unwrap();
        store.slots.write().unwrap().blobs.remove(a.id());

        assert!(store.list(false).unwrap().is_empty());
        assert!(store.get(a.id()).unwrap().is_none());
    }

    #[test]
    fn commit_upserts_and_delete_is_idempotent() {
        let store = InMemorySnapshotStore::new();
        let a = completed("a", true);
        store.commit(&a).unwrap();
        store.commit(&a).unwrap();
        assert_eq!(store.list(false).unwrap().len(), 1);

        store.delete(a.id()).unwrap();
        store.delete(a.id()).unwrap();
        assert!(store.list(false).unwrap().is_empty());
        assert!(store.get(a.id()).unwrap().is_none());
    }
}
