//! Stale-DNS behavior through the public resolver API.
//!
//! Verifies the host-cache freshness contract (a lookup within TTL
//! returns the inserted endpoints; past TTL plus the expired-delay bound
//! it never does) and the stale fast path: an expired entry with a zero
//! fresh-lookup timeout answers synchronously while the live lookup
//! refreshes the cache in the background.

use corenet::base::netlog::NetLog;
use corenet::dns::{
    Addrs, AddressFamily, EntrySource, Freshness, HostCache, HostCacheEntry, HostCacheKey, Name,
    Resolve, Resolving, StaleHostResolver, StaleResolverConfig,
};
use corenet::NetworkBinding;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn addr(last: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), 0)
}

struct SlowResolver {
    answer: Vec<SocketAddr>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Resolve for SlowResolver {
    fn resolve(&self, _name: Name) -> Resolving {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.clone();
        let delay = self.delay;
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(Box::new(answer.into_iter()) as Addrs)
        })
    }
}

fn expired_entry(endpoints: Vec<SocketAddr>, expired_for: Duration) -> HostCacheEntry {
    HostCacheEntry {
        endpoints,
        fetched_at: Instant::now() - Duration::from_secs(60) - expired_for,
        ttl: Duration::from_secs(60),
        source: EntrySource::Builtin,
        pinned_network: NetworkBinding::UNBOUND,
    }
}

#[test]
fn test_host_cache_freshness_contract() {
    let cache = HostCache::new(64);
    let key = HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND);

    // Within TTL: the same endpoints as the last insert.
    cache.insert(
        key.clone(),
        HostCacheEntry::new(
            vec![addr(1)],
            Duration::from_secs(60),
            EntrySource::Builtin,
            NetworkBinding::UNBOUND,
        ),
    );
    let (entry, freshness) = cache
        .lookup(&key, false, Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(freshness, Freshness::Fresh);
    assert_eq!(entry.endpoints, vec![addr(1)]);

    // Replace with an entry expired beyond the bound: never returned.
    cache.insert(
        key.clone(),
        expired_entry(vec![addr(1)], Duration::from_secs(120)),
    );
    assert!(cache
        .lookup(&key, false, Some(Duration::from_secs(60)))
        .is_none());
}

#[tokio::test]
async fn test_stale_fast_path_with_background_refresh() {
    // Host cache contains an expired entry for "x"; freshLookupTimeout=0
    // and stale enabled: resolve returns the stale endpoints while the
    // background lookup replaces the entry on completion.
    let cache = Arc::new(HostCache::new(64));
    let key = HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
    cache.insert(key.clone(), expired_entry(vec![addr(1)], Duration::from_secs(10)));

    let inner = Arc::new(SlowResolver {
        answer: vec![addr(9)],
        delay: Duration::from_millis(50),
        calls: AtomicUsize::new(0),
    });
    let config = StaleResolverConfig {
        enable_stale: true,
        fresh_lookup_timeout: Duration::ZERO,
        max_expired_delay: Duration::ZERO, // unbounded
        ..Default::default()
    };
    let resolver = StaleHostResolver::new(
        Arc::clone(&inner) as Arc<dyn Resolve>,
        Arc::clone(&cache),
        config,
        Arc::new(NetLog::new()),
    );

    let start = Instant::now();
    let endpoints = resolver
        .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
        .await
        .unwrap();
    assert_eq!(endpoints, vec![addr(1)], "stale endpoints served");
    assert!(
        start.elapsed() < Duration::from_millis(40),
        "stale answer did not wait for the live lookup"
    );
    assert_eq!(inner.calls.load(Ordering::SeqCst), 1, "live lookup started");

    // The background refresh lands.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (entry, freshness) = cache.lookup(&key, false, None).unwrap();
    assert_eq!(freshness, Freshness::Fresh);
    assert_eq!(entry.endpoints, vec![addr(9)]);
}

#[tokio::test]
async fn test_fresh_timeout_races_live_lookup() {
    // A live lookup slower than the timeout loses to the stale answer; a
    // fast one wins.
    let cache = Arc::new(HostCache::new(64));
    cache.insert(
        HostCacheKey::new("slow", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
        expired_entry(vec![addr(1)], Duration::from_secs(1)),
    );
    let slow = Arc::new(SlowResolver {
        answer: vec![addr(9)],
        delay: Duration::from_secs(20),
        calls: AtomicUsize::new(0),
    });
    let config = StaleResolverConfig {
        enable_stale: true,
        fresh_lookup_timeout: Duration::from_millis(20),
        max_expired_delay: Duration::ZERO,
        ..Default::default()
    };
    let resolver = StaleHostResolver::new(
        slow,
        Arc::clone(&cache),
        config.clone(),
        Arc::new(NetLog::new()),
    );
    let endpoints = resolver
        .resolve("slow", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
        .await
        .unwrap();
    assert_eq!(endpoints, vec![addr(1)]);

    cache.insert(
        HostCacheKey::new("fast", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
        expired_entry(vec![addr(1)], Duration::from_secs(1)),
    );
    let fast = Arc::new(SlowResolver {
        answer: vec![addr(9)],
        delay: Duration::ZERO,
        calls: AtomicUsize::new(0),
    });
    let resolver = StaleHostResolver::new(fast, cache, config, Arc::new(NetLog::new()));
    let endpoints = resolver
        .resolve("fast", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
        .await
        .unwrap();
    assert_eq!(endpoints, vec![addr(9)]);
}

#[test]
fn test_cross_network_pinning_rules() {
    // An entry pinned to one network never serves a caller bound to
    // another unless cross-network usage is allowed.
    let cache = HostCache::new(64);
    let wifi = NetworkBinding::from_handle(1);
    let cell = NetworkBinding::from_handle(2);

    cache.insert(
        HostCacheKey::new("pinned", AddressFamily::Unspecified, wifi),
        HostCacheEntry::new(
            vec![addr(5)],
            Duration::from_secs(60),
            EntrySource::Builtin,
            wifi,
        ),
    );

    let from_cell = HostCacheKey::new("pinned", AddressFamily::Unspecified, cell);
    assert!(cache.lookup(&from_cell, false, None).is_none());
    let (entry, _) = cache.lookup(&from_cell, true, None).unwrap();
    assert_eq!(entry.pinned_network, wifi);
}

#[test]
fn test_network_change_flush_policy() {
    let cache = HostCache::new(64);
    cache.insert(
        HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
        HostCacheEntry::new(
            vec![addr(1)],
            Duration::from_secs(60),
            EntrySource::Builtin,
            NetworkBinding::UNBOUND,
        ),
    );

    // Cross-network usage keeps entries across a change.
    cache.on_network_change(true);
    assert_eq!(cache.len(), 1);
    // Otherwise the change flushes.
    cache.on_network_change(false);
    assert!(cache.is_empty());
}
