//! Disk backend for the HTTP cache.
//!
//! Entries live under `<storage>/httpcache/`, one JSON file per entry
//! named by a hash of the cache key. A `LOCK` file taken with
//! `create_new` refuses a second engine on the same directory; the lock
//! is dropped on engine shutdown.

use super::{CacheEntry, CacheKey};
use crate::base::neterror::NetError;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const CACHE_DIR: &str = "httpcache";
const LOCK_FILE: &str = "LOCK";

pub struct DiskBackend {
    dir: PathBuf,
    lock_released: AtomicBool,
}

impl DiskBackend {
    /// Open (and lock) the cache directory.
    pub fn open(storage_path: &Path) -> Result<Self, NetError> {
        let dir = storage_path.join(CACHE_DIR);
        std::fs::create_dir_all(&dir).map_err(|_| NetError::CacheOpenFailure)?;

        let lock_path = dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::warn!(path = %dir.display(), "cache directory already in use");
                return Err(NetError::CacheOpenFailure);
            }
            Err(_) => return Err(NetError::CacheOpenFailure),
        }

        Ok(Self {
            dir,
            lock_released: AtomicBool::new(false),
        })
    }

    /// Read every persisted entry. Unparseable files are skipped.
    pub fn load_all(&self) -> Vec<(CacheKey, CacheEntry)> {
        let Ok(listing) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for file in listing.flatten() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("entry") {
                continue;
            }
            let Ok(data) = std::fs::read(&path) else {
                continue;
            };
            match serde_json::from_slice::<PersistedRecord>(&data) {
                Ok(record) => entries.push((
                    CacheKey {
                        url: record.url,
                        method: record.method,
                    },
                    record.entry,
                )),
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "dropping unreadable cache entry");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        entries
    }

    pub fn store(&self, key: &CacheKey, entry: &CacheEntry) {
        let record = PersistedRecord {
            url: key.url.clone(),
            method: key.method.clone(),
            entry: entry.clone(),
        };
        let path = self.entry_path(key);
        let tmp = path.with_extension("tmp");
        let Ok(payload) = serde_json::to_vec(&record) else {
            return;
        };
        if std::fs::write(&tmp, payload).is_ok() {
            let _ = std::fs::rename(&tmp, &path);
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        let _ = std::fs::remove_file(self.entry_path(key));
    }

    pub fn clear(&self) {
        if let Ok(listing) = std::fs::read_dir(&self.dir) {
            for file in listing.flatten() {
                if file.path().extension().and_then(|e| e.to_str()) == Some("entry") {
                    let _ = std::fs::remove_file(file.path());
                }
            }
        }
    }

    /// Release the directory lock.
    pub fn close(&self) {
        if !self.lock_released.swap(true, Ordering::SeqCst) {
            let _ = std::fs::remove_file(self.dir.join(LOCK_FILE));
        }
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        self.dir.join(format!("{:016x}.entry", hasher.finish()))
    }
}

impl Drop for DiskBackend {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedRecord {
    url: String,
    method: String,
    entry: CacheEntry,
}
