//! TTL-aware host cache with stale eligibility and network pinning.
//!
//! Entries are keyed by (host, address family, network binding). An entry
//! pinned to network N is only served to callers bound to N unless
//! cross-network usage is allowed. Capacity is bounded; eviction is LRU.

use crate::base::network::NetworkBinding;
use crate::dns::AddressFamily;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Where a cached resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    /// System `getaddrinfo`.
    System,
    /// Built-in (hickory) resolver.
    Builtin,
    /// Hosts-file style override.
    HostsFile,
    /// Restored from on-disk persistence.
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostCacheKey {
    pub host: String,
    pub family: AddressFamily,
    pub binding: NetworkBinding,
}

impl HostCacheKey {
    pub fn new(host: &str, family: AddressFamily, binding: NetworkBinding) -> Self {
        Self {
            host: host.to_ascii_lowercase(),
            family,
            binding,
        }
    }
}

/// Freshness of a returned entry relative to its TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// TTL elapsed; `expired_for` is how long ago.
    Stale { expired_for: Duration },
}

#[derive(Debug, Clone)]
pub struct HostCacheEntry {
    pub endpoints: Vec<SocketAddr>,
    pub fetched_at: Instant,
    pub ttl: Duration,
    pub source: EntrySource,
    /// Binding that was active when the resolution completed.
    pub pinned_network: NetworkBinding,
}

impl HostCacheEntry {
    pub fn new(
        endpoints: Vec<SocketAddr>,
        ttl: Duration,
        source: EntrySource,
        pinned_network: NetworkBinding,
    ) -> Self {
        Self {
            endpoints,
            fetched_at: Instant::now(),
            ttl,
            source,
            pinned_network,
        }
    }

    pub fn freshness(&self) -> Freshness {
        let age = self.fetched_at.elapsed();
        if age < self.ttl {
            Freshness::Fresh
        } else {
            Freshness::Stale {
                expired_for: age - self.ttl,
            }
        }
    }

    /// Stale entries remain eligible until `max_expired_delay` past TTL.
    /// `None` means unbounded.
    pub fn usable_within(&self, max_expired_delay: Option<Duration>) -> bool {
        match (self.freshness(), max_expired_delay) {
            (Freshness::Fresh, _) => true,
            (Freshness::Stale { .. }, None) => true,
            (Freshness::Stale { expired_for }, Some(max)) => expired_for <= max,
        }
    }
}

struct Slot {
    entry: HostCacheEntry,
    last_used: Instant,
    sequence: u64,
}

/// Bounded host cache shared by all requests of an engine.
pub struct HostCache {
    slots: DashMap<HostCacheKey, Slot>,
    max_entries: usize,
    // Tie-breaker for LRU when Instants collide.
    clock: AtomicU64,
}

impl Default for HostCache {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl HostCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            slots: DashMap::new(),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
        }
    }

    /// Insert or replace a resolution.
    pub fn insert(&self, key: HostCacheKey, entry: HostCacheEntry) {
        let sequence = self.clock.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(
            key,
            Slot {
                entry,
                last_used: Instant::now(),
                sequence,
            },
        );
        self.evict_over_capacity();
    }

    /// Look up an entry for a caller bound to `key.binding`.
    ///
    /// Returns the entry and its freshness, or `None` when there is no
    /// entry usable under the binding and staleness rules. When
    /// `allow_cross_network` is set and there is no exact-binding entry,
    /// an entry pinned to any other network may be served.
    pub fn lookup(
        &self,
        key: &HostCacheKey,
        allow_cross_network: bool,
        max_expired_delay: Option<Duration>,
    ) -> Option<(HostCacheEntry, Freshness)> {
        if let Some(found) = self.lookup_exact(key, max_expired_delay) {
            return Some(found);
        }

        if !allow_cross_network {
            return None;
        }

        // Any-binding scan: newest usable entry for (host, family) wins.
        let mut best: Option<(HostCacheKey, u64)> = None;
        for slot in self.slots.iter() {
            let k = slot.key();
            if k.host == key.host
                && k.family == key.family
                && slot.value().entry.usable_within(max_expired_delay)
                && best.as_ref().map_or(true, |(_, seq)| slot.value().sequence > *seq)
            {
                best = Some((k.clone(), slot.value().sequence));
            }
        }
        let (best_key, _) = best?;
        self.lookup_exact(&best_key, max_expired_delay)
    }

    fn lookup_exact(
        &self,
        key: &HostCacheKey,
        max_expired_delay: Option<Duration>,
    ) -> Option<(HostCacheEntry, Freshness)> {
        let mut slot = self.slots.get_mut(key)?;
        if !slot.entry.usable_within(max_expired_delay) {
            drop(slot);
            self.slots.remove(key);
            return None;
        }
        slot.last_used = Instant::now();
        let entry = slot.entry.clone();
        let freshness = entry.freshness();
        Some((entry, freshness))
    }

    /// Drop entries on a network change. Entries pinned to other networks
    /// survive only when cross-network usage is allowed.
    pub fn on_network_change(&self, allow_cross_network: bool) {
        if !allow_cross_network {
            self.slots.clear();
        }
    }

    pub fn remove(&self, key: &HostCacheKey) {
        self.slots.remove(key);
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of all slots, for persistence.
    pub fn snapshot(&self) -> Vec<(HostCacheKey, HostCacheEntry)> {
        self.slots
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().entry.clone()))
            .collect()
    }

    fn evict_over_capacity(&self) {
        while self.slots.len() > self.max_entries {
            // LRU scan; ties broken by insertion sequence.
            let mut victim: Option<(HostCacheKey, Instant, u64)> = None;
            for slot in self.slots.iter() {
                let candidate = (
                    slot.key().clone(),
                    slot.value().last_used,
                    slot.value().sequence,
                );
                let replace = match &victim {
                    None => true,
                    Some((_, used, seq)) => {
                        candidate.1 < *used || (candidate.1 == *used && candidate.2 < *seq)
                    }
                };
                if replace {
                    victim = Some(candidate);
                }
            }
            match victim {
                Some((key, _, _)) => {
                    self.slots.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 0)
    }

    fn entry_with_age(age: Duration, ttl: Duration, net: NetworkBinding) -> HostCacheEntry {
        HostCacheEntry {
            endpoints: vec![addr(1)],
            fetched_at: Instant::now() - age,
            ttl,
            source: EntrySource::Builtin,
            pinned_network: net,
        }
    }

    #[test]
    fn test_fresh_lookup_returns_last_insert() {
        let cache = HostCache::new(16);
        let key = HostCacheKey::new("Example.com", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
        cache.insert(
            key.clone(),
            HostCacheEntry::new(
                vec![addr(1)],
                Duration::from_secs(60),
                EntrySource::Builtin,
                NetworkBinding::UNBOUND,
            ),
        );

        let (entry, freshness) = cache.lookup(&key, false, Some(Duration::ZERO)).unwrap();
        assert_eq!(freshness, Freshness::Fresh);
        assert_eq!(entry.endpoints, vec![addr(1)]);
    }

    #[test]
    fn test_stale_within_delay() {
        let cache = HostCache::new(16);
        let key = HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
        cache.insert(
            key.clone(),
            entry_with_age(
                Duration::from_secs(90),
                Duration::from_secs(60),
                NetworkBinding::UNBOUND,
            ),
        );

        // Expired 30s ago, allowed up to 60s past TTL.
        let found = cache.lookup(&key, false, Some(Duration::from_secs(60)));
        assert!(matches!(found, Some((_, Freshness::Stale { .. }))));

        // Beyond the window the entry is unusable and removed.
        let found = cache.lookup(&key, false, Some(Duration::from_secs(10)));
        assert!(found.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unbounded_expired_delay() {
        let cache = HostCache::new(16);
        let key = HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
        cache.insert(
            key.clone(),
            entry_with_age(
                Duration::from_secs(3600),
                Duration::from_secs(1),
                NetworkBinding::UNBOUND,
            ),
        );
        assert!(cache.lookup(&key, false, None).is_some());
    }

    #[test]
    fn test_binding_isolation() {
        let cache = HostCache::new(16);
        let wifi = NetworkBinding::from_handle(1);
        let cell = NetworkBinding::from_handle(2);

        let wifi_key = HostCacheKey::new("x", AddressFamily::Unspecified, wifi);
        cache.insert(
            wifi_key.clone(),
            entry_with_age(Duration::ZERO, Duration::from_secs(60), wifi),
        );

        let cell_key = HostCacheKey::new("x", AddressFamily::Unspecified, cell);
        // Without cross-network usage the wifi entry is invisible.
        assert!(cache.lookup(&cell_key, false, None).is_none());
        // With it, the entry is served and still reports its pin.
        let (entry, _) = cache.lookup(&cell_key, true, None).unwrap();
        assert_eq!(entry.pinned_network, wifi);
    }

    #[test]
    fn test_network_change_flush() {
        let cache = HostCache::new(16);
        let key = HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
        cache.insert(
            key.clone(),
            entry_with_age(Duration::ZERO, Duration::from_secs(60), NetworkBinding::UNBOUND),
        );

        cache.on_network_change(true);
        assert_eq!(cache.len(), 1);

        cache.on_network_change(false);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = HostCache::new(2);
        for (i, host) in ["a", "b", "c"].iter().enumerate() {
            cache.insert(
                HostCacheKey::new(host, AddressFamily::Unspecified, NetworkBinding::UNBOUND),
                HostCacheEntry::new(
                    vec![addr(i as u8)],
                    Duration::from_secs(60),
                    EntrySource::Builtin,
                    NetworkBinding::UNBOUND,
                ),
            );
        }
        assert_eq!(cache.len(), 2);
        // "a" was the least recently used.
        let a = HostCacheKey::new("a", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
        assert!(cache.lookup(&a, false, None).is_none());
    }
}
