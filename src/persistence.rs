//! Keyed persistence shared across broker invocations.
//!
//! Every broker invocation is a fresh process, so session state lives in stores that outlive
//! it. [`KeyedStore::update`] is the only way to mutate a record: the closure runs while the
//! store is exclusively locked and its result is written back before the lock is released,
//! so two invocations racing on the same key are serialized.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

/// String-keyed record store with atomic per-key read-modify-write.
pub trait KeyedStore<V>: Send + Sync {
    /// Current record for `key`.
    fn get(&self, key: &str) -> Result<Option<V>, StoreError>;

    /// Run `apply` on the slot for `key` under an exclusive lock. Leaving `None` in the slot
    /// deletes the record.
    fn update(&self, key: &str, apply: &mut dyn FnMut(&mut Option<V>)) -> Result<(), StoreError>;
}

// ── File-backed ────────────────────────────────────────────────────

/// One JSON object per store file, guarded by a sibling `.lock` file.
#[derive(Debug, Clone)]
pub struct FileStore<V> {
    path: PathBuf,
    lock_path: PathBuf,
    _record: PhantomData<fn() -> V>,
}

impl<V> FileStore<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self {
            path,
            lock_path,
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self) -> Result<File, StoreError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| StoreError::io(&self.lock_path, e))
    }

    fn load(&self) -> Result<BTreeMap<String, V>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeMap::new());
        }
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, records: &BTreeMap<String, V>) -> Result<(), StoreError> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let serialized = serde_json::to_vec_pretty(records).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::io(parent, e))?;
        tmp.write_all(&serialized)
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(&self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::io(&self.path, e.error))?;
        Ok(())
    }
}

impl<V> KeyedStore<V> for FileStore<V>
where
    V: Serialize + DeserializeOwned,
{
    fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        let lock = self.open_lock()?;
        lock.lock_shared().map_err(|source| StoreError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        let mut records = self.load()?;
        drop(lock);
        Ok(records.remove(key))
    }

    fn update(&self, key: &str, apply: &mut dyn FnMut(&mut Option<V>)) -> Result<(), StoreError> {
        let lock = self.open_lock()?;
        lock.lock_exclusive().map_err(|source| StoreError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        let mut records = self.load()?;
        let mut slot = records.remove(key);
        apply(&mut slot);
        if let Some(record) = slot {
            records.insert(key.to_string(), record);
        }
        self.save(&records)?;
        drop(lock);
        Ok(())
    }
}

// ── In-memory ──────────────────────────────────────────────────────

/// Process-local store, for tests and for hosts that keep the broker resident.
#[derive(Debug)]
pub struct MemoryStore<V> {
    records: Mutex<HashMap<String, V>>,
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl<V> KeyedStore<V> for MemoryStore<V>
where
    V: Clone + Send,
{
    fn get(&self, key: &str) -> Result<Option<V>, StoreError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn update(&self, key: &str, apply: &mut dyn FnMut(&mut Option<V>)) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let mut slot = records.remove(key);
        apply(&mut slot);
        if let Some(record) = slot {
            records.insert(key.to_string(), record);
        }
        Ok(())
    }
}
