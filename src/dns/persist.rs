//! On-disk persistence for the host cache.
//!
//! Entries are written to `hostcache.json` under the engine's storage
//! path, no more often than `persist_delay`. Wall-clock expirations are
//! stored so restored entries keep their remaining lifetime across
//! process restarts.

use crate::base::network::NetworkBinding;
use crate::dns::host_cache::{EntrySource, HostCache, HostCacheEntry, HostCacheKey};
use crate::dns::AddressFamily;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const HOSTCACHE_FILE: &str = "hostcache.json";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    host: String,
    family: String,
    endpoints: Vec<SocketAddr>,
    expires_at: u64,
    pinned_network_id: u64,
}

fn family_tag(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::Unspecified => "unspec",
        AddressFamily::Ipv4 => "ipv4",
        AddressFamily::Ipv6 => "ipv6",
    }
}

fn family_from_tag(tag: &str) -> Option<AddressFamily> {
    match tag {
        "unspec" => Some(AddressFamily::Unspecified),
        "ipv4" => Some(AddressFamily::Ipv4),
        "ipv6" => Some(AddressFamily::Ipv6),
        _ => None,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Throttled writer/loader for `hostcache.json`.
pub struct HostCachePersister {
    path: PathBuf,
    persist_delay: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl HostCachePersister {
    pub fn new(storage_path: &Path, persist_delay: Duration) -> Self {
        Self {
            path: storage_path.join(HOSTCACHE_FILE),
            persist_delay,
            last_write: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Restore persisted entries into `cache`. Entries already past their
    /// wall-clock expiration are skipped. Returns how many were loaded.
    pub fn load_into(&self, cache: &HostCache) -> std::io::Result<usize> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let entries: Vec<PersistedEntry> = serde_json::from_slice(&data).unwrap_or_default();
        let now = unix_now();
        let mut loaded = 0;
        for persisted in entries {
            let Some(family) = family_from_tag(&persisted.family) else {
                continue;
            };
            if persisted.expires_at <= now || persisted.endpoints.is_empty() {
                continue;
            }
            let binding = if persisted.pinned_network_id == 0 {
                NetworkBinding::UNBOUND
            } else {
                NetworkBinding::from_handle(persisted.pinned_network_id)
            };
            let remaining = Duration::from_secs(persisted.expires_at - now);
            cache.insert(
                HostCacheKey::new(&persisted.host, family, binding),
                HostCacheEntry::new(persisted.endpoints, remaining, EntrySource::Persisted, binding),
            );
            loaded += 1;
        }
        tracing::debug!(count = loaded, "restored persisted host cache entries");
        Ok(loaded)
    }

    /// Write the cache if at least `persist_delay` elapsed since the last
    /// write. Returns true if a write happened.
    pub fn maybe_persist(&self, cache: &HostCache) -> std::io::Result<bool> {
        {
            let last = self.last_write.lock().unwrap();
            if let Some(at) = *last {
                if at.elapsed() < self.persist_delay {
                    return Ok(false);
                }
            }
        }
        self.flush(cache)?;
        Ok(true)
    }

    /// Unconditional write, used at shutdown.
    pub fn flush(&self, cache: &HostCache) -> std::io::Result<()> {
        let now = unix_now();
        let entries: Vec<PersistedEntry> = cache
            .snapshot()
            .into_iter()
            .filter_map(|(key, entry)| {
                // Only fresh remaining lifetime is worth persisting.
                let remaining = entry.ttl.checked_sub(entry.fetched_at.elapsed())?;
                Some(PersistedEntry {
                    host: key.host,
                    family: family_tag(key.family).to_string(),
                    endpoints: entry.endpoints,
                    expires_at: now + remaining.as_secs(),
                    pinned_network_id: entry.pinned_network.handle(),
                })
            })
            .collect();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec(&entries).map_err(std::io::Error::other)?;
        std::fs::write(&tmp, payload)?;
        std::fs::rename(&tmp, &self.path)?;
        *self.last_write.lock().unwrap() = Some(Instant::now());
        Ok(())
    }
}
