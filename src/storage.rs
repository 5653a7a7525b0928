//! Durable per-profile key/value storage.
//!
//! Plain string keys to string values, no schema. The session wallet and the
//! per-account UI hints both live here.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

pub trait ProfileStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;

    fn set(&self, key: &str, value: &str) -> AppResult<()>;

    /// Removes every key in one step; no partial removal is observable.
    fn remove(&self, keys: &[&str]) -> AppResult<()>;

    fn contains(&self, key: &str) -> AppResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Non-persistent store, cleared when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> AppResult<()> {
        let mut entries = self.entries.write();
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }
}

/// JSON file backed store. The whole map is rewritten on every mutation via a
/// temp file and rename, so readers see either the old or the new file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|err| {
                AppError::Storage(format!("failed to read {}: {err}", path.display()))
            })?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                    Ok(map) => map,
                    Err(err) => {
                        // An unreadable profile is treated as empty rather than fatal.
                        warn!("profile file {} is corrupt, starting empty: {err}", path.display());
                        BTreeMap::new()
                    }
                }
            }
        } else {
            BTreeMap::new()
        };

        debug!("opened profile store at {} ({} keys)", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> AppResult<()> {
        let payload = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp, payload)
            .map_err(|err| AppError::Storage(format!("failed to write {}: {err}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|err| {
            AppError::Storage(format!("failed to replace {}: {err}", self.path.display()))
        })
    }
}

impl ProfileStore for FileStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        next.insert(key.to_string(), value.to_string());
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, keys: &[&str]) -> AppResult<()> {
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        for key in keys {
            next.remove(*key);
        }
        if next.len() == entries.len() {
            return Ok(());
        }
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }
}
