//! Filesystem-backed snapshot store.
//!
//! Layout under the root directory:
//!
//! ```text
//! active.json              active slot (absent when no job is running)
//! catalog.json             id -> catalog entry
//! store.lock               held while a writer mutates the store
//! snapshots/<id>.json      full snapshot blobs
//! ```
//!
//! Every write goes to a uniquely named temporary file first and is renamed
//! into place, so a crash leaves either the old or the new content, never a
//! torn file. Mutations take `store.lock` (created exclusively), so several
//! processes may share one directory.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use enrollsnap_core::{CatalogEntry, Snapshot, SnapshotId};

use super::{SnapshotStore, StoreError, decode_active, sort_catalog};

const ACTIVE_FILE: &str = "active.json";
const CATALOG_FILE: &str = "catalog.json";
const BLOB_DIR: &str = "snapshots";
const LOCK_FILE: &str = "store.lock";

const LOCK_RETRY: Duration = Duration::from_millis(5);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// A lock older than this was left behind by a crashed writer.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Snapshot store persisting JSON files under a directory.
///
/// Writers are serialized by an in-process mutex and, across processes, by
/// an exclusively created lock file.
#[derive(Debug)]
pub struct FsSnapshotStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsSnapshotStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let blobs = root.join(BLOB_DIR);
        fs::create_dir_all(&blobs).map_err(|e| StoreError::io(&blobs, e))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> Result<WriteGuard<'_>, StoreError> {
        let in_process = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let file = DirLock::acquire(self.root.join(LOCK_FILE))?;
        Ok(WriteGuard {
            _file: file,
            _in_process: in_process,
        })
    }

    fn active_path(&self) -> PathBuf {
        self.root.join(ACTIVE_FILE)
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    fn blob_path(&self, id: &SnapshotId) -> Result<PathBuf, StoreError> {
        // ids become file names
        let id: SnapshotId = id
            .as_str()
            .parse()
            .map_err(|e| StoreError::Storage(format!("unusable snapshot id: {e}")))?;
        Ok(self.root.join(BLOB_DIR).join(format!("{id}.json")))
    }

    fn read_catalog(&self) -> Result<BTreeMap<SnapshotId, CatalogEntry>, StoreError> {
        match read_optional(&self.catalog_path())? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(BTreeMap::new()),
        }
    }

    fn write_catalog(&self, catalog: &BTreeMap<SnapshotId, CatalogEntry>) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(catalog)?;
        write_atomic(&self.catalog_path(), raw.as_bytes())
    }

    fn read_active_locked(&self) -> Result<Option<Snapshot>, StoreError> {
        Ok(read_optional(&self.active_path())?
            .as_deref()
            .and_then(decode_active))
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn save_active(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let raw = snapshot.to_json()?;
        let _guard = self.lock()?;
        write_atomic(&self.active_path(), raw.as_bytes())
    }

    fn load_active(&self) -> Result<Option<Snapshot>, StoreError> {
        self.read_active_locked()
    }

    fn clear_active(&self) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        remove_optional(&self.active_path())
    }

    fn claim_active(&self, snapshot: &Snapshot) -> Result<bool, StoreError> {
        let raw = snapshot.to_json()?;
        let _guard = self.lock()?;
        if self.read_active_locked()?.is_some() {
            return Ok(false);
        }
        write_atomic(&self.active_path(), raw.as_bytes())?;
        Ok(true)
    }

    fn commit(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let raw = snapshot.to_json()?;
        let blob = self.blob_path(snapshot.id())?;
        let _guard = self.lock()?;

        // blob first: a catalog entry without a blob is filtered from listings
        write_atomic(&blob, raw.as_bytes())?;
        let mut catalog = self.read_catalog()?;
        let entry = snapshot.catalog_entry();
        catalog.insert(entry.id.clone(), entry);
        self.write_catalog(&catalog)?;

        debug!(snapshot_id = %snapshot.id(), path = %blob.display(), "snapshot committed to catalog");
        Ok(())
    }

    fn delete(&self, id: &SnapshotId) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut catalog = self.read_catalog()?;
        if catalog.remove(id).is_some() {
            self.write_catalog(&catalog)?;
        }
        match self.blob_path(id) {
            Ok(blob) => remove_optional(&blob),
            // an id that cannot name a file never had a blob
            Err(_) => Ok(()),
        }
    }

    fn get(&self, id: &SnapshotId) -> Result<Option<Snapshot>, StoreError> {
        if !self.read_catalog()?.contains_key(id) {
            return Ok(None);
        }
        match read_optional(&self.blob_path(id)?)? {
            Some(raw) => Ok(Some(Snapshot::from_json(&raw)?)),
            None => Ok(None),
        }
    }

    fn list(&self, only_valid: bool) -> Result<Vec<CatalogEntry>, StoreError> {
        let mut entries = Vec::new();
        for entry in self.read_catalog()?.into_values() {
            if only_valid && !entry.is_valid {
                continue;
            }
            let has_blob = match self.blob_path(&entry.id) {
                Ok(path) => path.is_file(),
                Err(_) => false,
            };
            if !has_blob {
                warn!(snapshot_id = %entry.id, "catalog entry has no snapshot blob; skipping");
                continue;
            }
            entries.push(entry);
        }
        sort_catalog(&mut entries);
        Ok(entries)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn remove_optional(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Both writer locks; the file lock is released first.
struct WriteGuard<'a> {
    _file: DirLock,
    _in_process: MutexGuard<'a, ()>,
}

/// Cross-process writer lock backed by an exclusively created file.
#[derive(Debug)]
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // owner pid, for operators inspecting a stuck lock
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(path = %path.display(), "removing stale store lock");
                        remove_optional(&path)?;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Storage(format!(
                            "timed out waiting for store lock {}",
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to release store lock");
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}
