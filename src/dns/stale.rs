//! Fresh-vs-stale resolution arbitration.
//!
//! `StaleHostResolver` sits between the engine and a raw `Resolve`
//! implementation. A lookup first consults the host cache; a fresh entry
//! answers immediately. Otherwise a live lookup starts and a timer
//! decides whether an eligible stale entry is served early while the live
//! lookup keeps running to refresh the cache.

use crate::base::netlog::{NetLog, NetLogEventType};
use crate::base::neterror::NetError;
use crate::base::network::NetworkBinding;
use crate::dns::gai::SocketAddrs;
use crate::dns::host_cache::{
    EntrySource, Freshness, HostCache, HostCacheEntry, HostCacheKey,
};
use crate::dns::{AddressFamily, Name, Resolve};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Stale-DNS policy knobs. Field semantics follow the engine options of
/// the same names.
#[derive(Debug, Clone)]
pub struct StaleResolverConfig {
    pub enable_stale: bool,
    /// How long to wait for a fresh answer before yielding a stale one.
    /// Zero yields the stale answer immediately.
    pub fresh_lookup_timeout: Duration,
    /// Upper bound past TTL for stale eligibility. Zero means unbounded.
    pub max_expired_delay: Duration,
    pub allow_cross_network_usage: bool,
    pub use_stale_on_name_not_resolved: bool,
    pub preestablish_connections_to_stale_dns_results: bool,
    /// TTL applied to resolutions whose transport does not carry one.
    pub default_ttl: Duration,
    /// Source tag recorded on inserted entries.
    pub source: EntrySource,
}

impl Default for StaleResolverConfig {
    fn default() -> Self {
        Self {
            enable_stale: false,
            fresh_lookup_timeout: Duration::from_millis(250),
            max_expired_delay: Duration::from_secs(3600),
            allow_cross_network_usage: false,
            use_stale_on_name_not_resolved: false,
            preestablish_connections_to_stale_dns_results: false,
            default_ttl: Duration::from_secs(60),
            source: EntrySource::Builtin,
        }
    }
}

impl StaleResolverConfig {
    fn max_expired(&self) -> Option<Duration> {
        if self.max_expired_delay.is_zero() {
            None
        } else {
            Some(self.max_expired_delay)
        }
    }
}

/// Hint emitted when a stale answer was served: the session pool may dial
/// these endpoints opportunistically and switch once fresh results land.
#[derive(Debug, Clone)]
pub struct PreconnectHint {
    pub host: String,
    pub endpoints: Vec<SocketAddr>,
    pub binding: NetworkBinding,
}

/// Host resolver with TTL cache and stale-while-revalidate policy.
pub struct StaleHostResolver {
    inner: Arc<dyn Resolve>,
    cache: Arc<HostCache>,
    config: StaleResolverConfig,
    netlog: Arc<NetLog>,
    preconnect_tx: Option<mpsc::UnboundedSender<PreconnectHint>>,
}

impl StaleHostResolver {
    pub fn new(
        inner: Arc<dyn Resolve>,
        cache: Arc<HostCache>,
        config: StaleResolverConfig,
        netlog: Arc<NetLog>,
    ) -> Self {
        Self {
            inner,
            cache,
            config,
            netlog,
            preconnect_tx: None,
        }
    }

    /// Register the channel receiving pre-connection hints. Only used
    /// when `preestablish_connections_to_stale_dns_results` is set.
    pub fn set_preconnect_channel(&mut self, tx: mpsc::UnboundedSender<PreconnectHint>) {
        self.preconnect_tx = Some(tx);
    }

    pub fn cache(&self) -> &Arc<HostCache> {
        &self.cache
    }

    /// Resolve `host` for a caller bound to `binding`.
    ///
    /// Freshness arbitration:
    /// 1. fresh cache entry answers immediately;
    /// 2. otherwise a live lookup starts;
    /// 3. if a usable stale entry exists, a `fresh_lookup_timeout` timer
    ///    races the live lookup and the stale endpoints win on expiry
    ///    (the live lookup continues in the background to refresh);
    /// 4. a live NXDOMAIN falls back to stale under
    ///    `use_stale_on_name_not_resolved`.
    pub async fn resolve(
        &self,
        host: &str,
        family: AddressFamily,
        binding: NetworkBinding,
    ) -> Result<Vec<SocketAddr>, NetError> {
        // IP literals bypass both cache and resolver.
        if let Some(addrs) = SocketAddrs::try_parse(host, 0) {
            return Ok(family.select(addrs.into_vec()));
        }

        let key = HostCacheKey::new(host, family, binding);
        let stale_candidate = match self.cache.lookup(
            &key,
            self.config.allow_cross_network_usage,
            self.config.max_expired(),
        ) {
            Some((entry, Freshness::Fresh)) => {
                tracing::trace!(host, "host cache hit (fresh)");
                return Ok(entry.endpoints);
            }
            Some((entry, Freshness::Stale { .. })) if self.config.enable_stale => Some(entry),
            _ => None,
        };

        let fresh = self.spawn_fresh_lookup(host.to_string(), family, binding);

        let Some(stale) = stale_candidate else {
            return self.await_fresh(fresh, &key).await;
        };

        if self.config.fresh_lookup_timeout.is_zero() {
            return Ok(self.serve_stale(host, binding, stale));
        }

        let timer = tokio::time::sleep(self.config.fresh_lookup_timeout);
        tokio::pin!(timer);
        let mut fresh = fresh;
        tokio::select! {
            outcome = &mut fresh => match outcome {
                Ok(Ok(endpoints)) => Ok(endpoints),
                Ok(Err(err)) => self.stale_on_failure(host, binding, stale, err),
                Err(_) => Err(NetError::Unexpected),
            },
            _ = &mut timer => Ok(self.serve_stale(host, binding, stale)),
        }
    }

    /// Flush policy applied when the OS reports a network change.
    pub fn on_network_change(&self) {
        self.cache
            .on_network_change(self.config.allow_cross_network_usage);
    }

    fn spawn_fresh_lookup(
        &self,
        host: String,
        family: AddressFamily,
        binding: NetworkBinding,
    ) -> tokio::task::JoinHandle<Result<Vec<SocketAddr>, NetError>> {
        let inner = Arc::clone(&self.inner);
        let cache = Arc::clone(&self.cache);
        let ttl = self.config.default_ttl;
        let source = self.config.source;
        tokio::spawn(async move {
            let addrs = inner.resolve(Name::new(host.clone())).await?;
            let endpoints = family.select(addrs.collect());
            if endpoints.is_empty() {
                return Err(NetError::NameNotResolved);
            }
            cache.insert(
                HostCacheKey::new(&host, family, binding),
                HostCacheEntry::new(endpoints.clone(), ttl, source, binding),
            );
            Ok(endpoints)
        })
    }

    async fn await_fresh(
        &self,
        fresh: tokio::task::JoinHandle<Result<Vec<SocketAddr>, NetError>>,
        key: &HostCacheKey,
    ) -> Result<Vec<SocketAddr>, NetError> {
        match fresh.await {
            Ok(Ok(endpoints)) => Ok(endpoints),
            Ok(Err(err)) => {
                // NXDOMAIN fallback needs a second look at the cache: the
                // stale-eligibility above required `enable_stale`, this
                // path only requires the dedicated option.
                if self.config.use_stale_on_name_not_resolved
                    && err == NetError::NameNotResolved
                {
                    if let Some((entry, _)) = self.cache.lookup(
                        key,
                        self.config.allow_cross_network_usage,
                        self.config.max_expired(),
                    ) {
                        self.netlog.add_event_params(
                            NetLogEventType::DnsStaleServed,
                            serde_json::json!({"host": key.host, "reason": "name_not_resolved"}),
                        );
                        return Ok(entry.endpoints);
                    }
                }
                Err(err)
            }
            Err(_) => Err(NetError::Unexpected),
        }
    }

    fn stale_on_failure(
        &self,
        host: &str,
        binding: NetworkBinding,
        stale: HostCacheEntry,
        err: NetError,
    ) -> Result<Vec<SocketAddr>, NetError> {
        if self.config.use_stale_on_name_not_resolved && err == NetError::NameNotResolved {
            return Ok(self.serve_stale(host, binding, stale));
        }
        Err(err)
    }

    fn serve_stale(
        &self,
        host: &str,
        binding: NetworkBinding,
        stale: HostCacheEntry,
    ) -> Vec<SocketAddr> {
        self.netlog.add_event_params(
            NetLogEventType::DnsStaleServed,
            serde_json::json!({"host": host}),
        );
        if self.config.preestablish_connections_to_stale_dns_results {
            if let Some(tx) = &self.preconnect_tx {
                let _ = tx.send(PreconnectHint {
                    host: host.to_string(),
                    endpoints: stale.endpoints.clone(),
                    binding,
                });
            }
        }
        stale.endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Addrs, Resolving};
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), 0)
    }

    /// Resolver returning a fixed answer after an optional delay, or a
    /// fixed error. Counts calls.
    struct ScriptedResolver {
        answer: Result<Vec<SocketAddr>, NetError>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedResolver {
        fn ok(addrs: Vec<SocketAddr>, delay: Duration) -> Self {
            Self {
                answer: Ok(addrs),
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(err: NetError) -> Self {
            Self {
                answer: Err(err),
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Resolve for ScriptedResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer.clone();
            let delay = self.delay;
            Box::pin(async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                answer.map(|addrs| Box::new(addrs.into_iter()) as Addrs)
            })
        }
    }

    fn stale_entry(endpoints: Vec<SocketAddr>) -> HostCacheEntry {
        HostCacheEntry {
            endpoints,
            fetched_at: Instant::now() - Duration::from_secs(120),
            ttl: Duration::from_secs(60),
            source: EntrySource::Builtin,
            pinned_network: NetworkBinding::UNBOUND,
        }
    }

    fn resolver_with(
        inner: Arc<dyn Resolve>,
        cache: Arc<HostCache>,
        config: StaleResolverConfig,
    ) -> StaleHostResolver {
        StaleHostResolver::new(inner, cache, config, Arc::new(NetLog::new()))
    }

    #[tokio::test]
    async fn test_ip_literal_bypasses_resolver() {
        let inner = Arc::new(ScriptedResolver::failing(NetError::NameNotResolved));
        let calls = Arc::clone(&inner);
        let resolver = resolver_with(
            inner,
            Arc::new(HostCache::new(16)),
            StaleResolverConfig::default(),
        );

        let out = resolver
            .resolve("127.0.0.1", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();
        assert_eq!(out[0].ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(calls.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fresh_cache_hit_skips_lookup() {
        let inner = Arc::new(ScriptedResolver::failing(NetError::NameNotResolved));
        let calls = Arc::clone(&inner);
        let cache = Arc::new(HostCache::new(16));
        cache.insert(
            HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
            HostCacheEntry::new(
                vec![addr(1)],
                Duration::from_secs(60),
                EntrySource::Builtin,
                NetworkBinding::UNBOUND,
            ),
        );

        let resolver = resolver_with(inner, cache, StaleResolverConfig::default());
        let out = resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();
        assert_eq!(out, vec![addr(1)]);
        assert_eq!(calls.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_fast_path_with_zero_timeout() {
        // Scenario: expired entry, freshLookupTimeout=0, enableStale=true.
        // The stale endpoints come back immediately while the live lookup
        // replaces the entry in the background.
        let inner = Arc::new(ScriptedResolver::ok(
            vec![addr(9)],
            Duration::from_millis(30),
        ));
        let cache = Arc::new(HostCache::new(16));
        cache.insert(
            HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
            stale_entry(vec![addr(1)]),
        );

        let config = StaleResolverConfig {
            enable_stale: true,
            fresh_lookup_timeout: Duration::ZERO,
            max_expired_delay: Duration::ZERO,
            ..Default::default()
        };
        let resolver = resolver_with(inner, Arc::clone(&cache), config);

        let out = resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();
        assert_eq!(out, vec![addr(1)], "stale endpoints served synchronously");

        // Background refresh lands and replaces the entry.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let key = HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND);
        let (entry, freshness) = cache.lookup(&key, false, None).unwrap();
        assert_eq!(freshness, Freshness::Fresh);
        assert_eq!(entry.endpoints, vec![addr(9)]);
    }

    #[tokio::test]
    async fn test_fast_fresh_answer_beats_stale_timer() {
        let inner = Arc::new(ScriptedResolver::ok(vec![addr(9)], Duration::ZERO));
        let cache = Arc::new(HostCache::new(16));
        cache.insert(
            HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
            stale_entry(vec![addr(1)]),
        );

        let config = StaleResolverConfig {
            enable_stale: true,
            fresh_lookup_timeout: Duration::from_secs(5),
            max_expired_delay: Duration::ZERO,
            ..Default::default()
        };
        let resolver = resolver_with(inner, cache, config);

        let out = resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();
        assert_eq!(out, vec![addr(9)], "fresh answer preferred when quick");
    }

    #[tokio::test]
    async fn test_slow_fresh_lookup_yields_stale() {
        let inner = Arc::new(ScriptedResolver::ok(vec![addr(9)], Duration::from_secs(30)));
        let cache = Arc::new(HostCache::new(16));
        cache.insert(
            HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
            stale_entry(vec![addr(1)]),
        );

        let config = StaleResolverConfig {
            enable_stale: true,
            fresh_lookup_timeout: Duration::from_millis(10),
            max_expired_delay: Duration::ZERO,
            ..Default::default()
        };
        let resolver = resolver_with(inner, cache, config);

        let out = resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();
        assert_eq!(out, vec![addr(1)]);
    }

    #[tokio::test]
    async fn test_stale_on_name_not_resolved() {
        let inner = Arc::new(ScriptedResolver::failing(NetError::NameNotResolved));
        let cache = Arc::new(HostCache::new(16));
        cache.insert(
            HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
            stale_entry(vec![addr(1)]),
        );

        // Without the option the failure surfaces.
        let config = StaleResolverConfig {
            enable_stale: false,
            use_stale_on_name_not_resolved: false,
            max_expired_delay: Duration::ZERO,
            ..Default::default()
        };
        let resolver = resolver_with(Arc::clone(&inner) as Arc<dyn Resolve>, Arc::clone(&cache), config);
        let err = resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap_err();
        assert_eq!(err, NetError::NameNotResolved);

        // With it the stale endpoints answer.
        let config = StaleResolverConfig {
            enable_stale: false,
            use_stale_on_name_not_resolved: true,
            max_expired_delay: Duration::ZERO,
            ..Default::default()
        };
        let resolver = resolver_with(inner, cache, config);
        let out = resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();
        assert_eq!(out, vec![addr(1)]);
    }

    #[tokio::test]
    async fn test_preconnect_hint_emitted() {
        let inner = Arc::new(ScriptedResolver::ok(vec![addr(9)], Duration::from_secs(30)));
        let cache = Arc::new(HostCache::new(16));
        cache.insert(
            HostCacheKey::new("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND),
            stale_entry(vec![addr(1)]),
        );

        let config = StaleResolverConfig {
            enable_stale: true,
            fresh_lookup_timeout: Duration::ZERO,
            max_expired_delay: Duration::ZERO,
            preestablish_connections_to_stale_dns_results: true,
            ..Default::default()
        };
        let mut resolver = resolver_with(inner, cache, config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        resolver.set_preconnect_channel(tx);

        resolver
            .resolve("x", AddressFamily::Unspecified, NetworkBinding::UNBOUND)
            .await
            .unwrap();

        let hint = rx.recv().await.unwrap();
        assert_eq!(hint.host, "x");
        assert_eq!(hint.endpoints, vec![addr(1)]);
    }
}
