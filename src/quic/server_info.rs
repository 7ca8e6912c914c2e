//! QUIC server config store for 0-RTT resumption.
//!
//! Opaque session blobs are cached in memory (bounded by the configured
//! size) and, when a storage path is set, persisted under
//! `quic_server_info/<host>` so fresh processes can attempt 0-RTT.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const DIR_NAME: &str = "quic_server_info";

struct CachedInfo {
    blob: Vec<u8>,
    last_used: u64,
}

/// Bounded cache of per-host 0-RTT resumption blobs.
pub struct QuicServerInfoStore {
    mem: DashMap<String, CachedInfo>,
    capacity: usize,
    dir: Option<PathBuf>,
    clock: AtomicU64,
}

impl QuicServerInfoStore {
    pub fn new(capacity: usize, storage_path: Option<&Path>) -> Self {
        let dir = storage_path.map(|p| p.join(DIR_NAME));
        if let Some(dir) = &dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                tracing::warn!(error = %e, "cannot create quic_server_info dir");
            }
        }
        Self {
            mem: DashMap::new(),
            capacity: capacity.max(1),
            dir,
            clock: AtomicU64::new(0),
        }
    }

    /// Fetch the resumption blob for `host`, falling back to disk.
    pub fn get(&self, host: &str) -> Option<Vec<u8>> {
        let key = host.to_ascii_lowercase();
        if let Some(mut cached) = self.mem.get_mut(&key) {
            cached.last_used = self.clock.fetch_add(1, Ordering::Relaxed);
            return Some(cached.blob.clone());
        }
        let path = self.file_for(&key)?;
        let blob = std::fs::read(path).ok()?;
        self.insert_mem(key, blob.clone());
        Some(blob)
    }

    /// Record a fresh blob after a successful handshake.
    pub fn put(&self, host: &str, blob: Vec<u8>) {
        let key = host.to_ascii_lowercase();
        if let Some(path) = self.file_for(&key) {
            if let Err(e) = std::fs::write(&path, &blob) {
                tracing::debug!(host = %key, error = %e, "quic server info persist failed");
            }
        }
        self.insert_mem(key, blob);
    }

    /// Drop state for a host (e.g. after the server rejected resumption).
    pub fn remove(&self, host: &str) {
        let key = host.to_ascii_lowercase();
        self.mem.remove(&key);
        if let Some(path) = self.file_for(&key) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    fn insert_mem(&self, key: String, blob: Vec<u8>) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        self.mem.insert(
            key,
            CachedInfo {
                blob,
                last_used: stamp,
            },
        );
        while self.mem.len() > self.capacity {
            let victim = self
                .mem
                .iter()
                .min_by_key(|e| e.value().last_used)
                .map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    self.mem.remove(&key);
                }
                None => break,
            }
        }
    }

    fn file_for(&self, host: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        // Hostnames are not path-safe as-is on every filesystem.
        let safe: String = host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        Some(dir.join(safe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("corenet-quicinfo-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn test_memory_roundtrip() {
        let store = QuicServerInfoStore::new(4, None);
        store.put("Example.COM", vec![1, 2, 3]);
        assert_eq!(store.get("example.com"), Some(vec![1, 2, 3]));
        store.remove("example.com");
        assert_eq!(store.get("example.com"), None);
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let store = QuicServerInfoStore::new(2, None);
        store.put("a", vec![1]);
        store.put("b", vec![2]);
        // Touch "a" so "b" becomes the LRU.
        store.get("a");
        store.put("c", vec![3]);
        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
    }

    #[test]
    fn test_disk_persistence() {
        let dir = scratch_dir("disk");
        {
            let store = QuicServerInfoStore::new(4, Some(&dir));
            store.put("h3.example", vec![9, 9]);
        }
        // A fresh store reads the blob back from disk.
        let store = QuicServerInfoStore::new(4, Some(&dir));
        assert_eq!(store.get("h3.example"), Some(vec![9, 9]));
        std::fs::remove_dir_all(&dir).ok();
    }
}
