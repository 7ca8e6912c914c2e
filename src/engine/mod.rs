//! Engine façade: builds the component stack, hands out request
//! builders, and owns lifecycle (network binding, NetLog, shutdown).

pub mod executor;
pub mod experimental;
pub mod options;

pub use executor::{DirectExecutor, Executor, NetworkRunner, SingleThreadExecutor};
pub use options::{DnsOptions, EngineOptions};

use crate::base::netlog::{NetLog, NetLogEventType};
use crate::base::neterror::NetError;
use crate::base::network::{NetworkBinding, NetworkChangeEvent, NetworkChangeNotifier};
use crate::cache::{CacheMode, HttpCache};
use crate::dns::{
    DnsResolverWithOverrides, GaiResolver, HickoryResolver, HostCache, HostCachePersister,
    Resolve, StaleHostResolver, StaleResolverConfig,
};
use crate::dns::host_cache::EntrySource;
use crate::pool::{PoolConfig, PrivacyMode, SessionKey, SessionPool};
use crate::quic::QuicServerInfoStore;
use crate::request::callback::RequestFinishedListener;
use crate::request::job::RequestContext;
use crate::request::{
    BidirectionalStreamBuilder, BidirectionalStreamCallback, UrlRequestBuilder, UrlRequestCallback,
};
use crate::security::pinning::{PinSet, PinStore};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// Library version reported in the default user agent.
pub fn version_string() -> &'static str {
    concat!("corenet/", env!("CARGO_PKG_VERSION"))
}

/// Builder for [`Engine`]. Mirrors the typed options; experimental JSON
/// knobs are applied through [`set_experimental_options`].
///
/// [`set_experimental_options`]: EngineBuilder::set_experimental_options
pub struct EngineBuilder {
    options: EngineOptions,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            options: EngineOptions::default(),
        }
    }

    pub fn set_user_agent(mut self, user_agent: &str) -> Self {
        self.options.user_agent = user_agent.to_string();
        self
    }

    pub fn set_storage_path(mut self, path: &Path) -> Self {
        self.options.storage_path = Some(path.to_path_buf());
        self
    }

    pub fn enable_http2(mut self, enable: bool) -> Self {
        self.options.enable_http2 = enable;
        self
    }

    pub fn enable_quic(mut self, enable: bool) -> Self {
        self.options.enable_quic = enable;
        self
    }

    pub fn enable_brotli(mut self, enable: bool) -> Self {
        self.options.enable_brotli = enable;
        self
    }

    pub fn enable_http_cache(mut self, mode: CacheMode, max_size: usize) -> Self {
        self.options.cache_mode = mode;
        self.options.cache_max_size = max_size;
        self
    }

    pub fn add_quic_hint(mut self, host: &str, port: u16, alternate_port: u16) -> Self {
        self.options.quic_hints.push(crate::pool::QuicHint {
            host: host.to_string(),
            port,
            alternate_port,
        });
        self
    }

    pub fn set_dns_options(mut self, dns: DnsOptions) -> Self {
        self.options.dns = dns;
        self
    }

    pub fn set_connection_migration_options(
        mut self,
        migration: crate::quic::MigrationConfig,
    ) -> Self {
        self.options.migration = migration;
        self
    }

    pub fn set_quic_options(mut self, quic: crate::quic::QuicConfig) -> Self {
        self.options.quic = quic;
        self
    }

    /// Pin SPKI hashes for a host. Connections to it present at least
    /// one pinned key or fail before any request byte is sent.
    pub fn add_public_key_pins(
        mut self,
        hostname: &str,
        pins_sha256: Vec<[u8; 32]>,
        include_subdomains: bool,
        expires: Option<time::OffsetDateTime>,
    ) -> Self {
        let mut pin_set = PinSet::new(hostname).include_subdomains(include_subdomains);
        if let Some(expiry) = expires {
            pin_set = pin_set.expires_at(expiry);
        }
        for pin in pins_sha256 {
            pin_set.add_pin(pin);
        }
        self.options.public_key_pins.push(pin_set);
        self
    }

    pub fn set_pinning_bypass_for_local_trust_anchors(mut self, bypass: bool) -> Self {
        self.options.pinning_bypass_for_local_trust_anchors = bypass;
        self
    }

    pub fn set_request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = Some(timeout);
        self
    }

    pub fn set_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    /// Apply a legacy JSON experimental-options document.
    pub fn set_experimental_options(mut self, json: &str) -> Result<Self, NetError> {
        experimental::apply_json(&mut self.options, json)?;
        Ok(self)
    }

    /// Direct access for programmatic configuration.
    pub fn options_mut(&mut self) -> &mut EngineOptions {
        &mut self.options
    }

    pub fn build(self) -> Result<Engine, NetError> {
        Engine::from_options(self.options)
    }
}

struct EngineInner {
    ctx: Arc<RequestContext>,
    resolver: Arc<StaleHostResolver>,
    pool: Arc<SessionPool>,
    cache: Arc<HttpCache>,
    netlog: Arc<NetLog>,
    notifier: Arc<NetworkChangeNotifier>,
    persister: Option<Arc<HostCachePersister>>,
    host_cache: Arc<HostCache>,
    runner: Mutex<NetworkRunner>,
    in_flight: Arc<AtomicUsize>,
    bound_network: Arc<Mutex<NetworkBinding>>,
    listeners: Arc<Mutex<Vec<Arc<dyn RequestFinishedListener>>>>,
    allow_cross_network_dns: bool,
}

/// The HTTP client engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn from_options(options: EngineOptions) -> Result<Self, NetError> {
        options.migration.validate()?;

        let netlog = Arc::new(NetLog::new());
        let notifier = Arc::new(NetworkChangeNotifier::new());

        // HTTP cache first: disk modes take the directory lock.
        let cache = Arc::new(HttpCache::open(
            options.cache_mode,
            options.cache_max_size,
            options.storage_path.as_deref(),
        )?);

        // Host cache, optionally restored from disk.
        let host_cache = Arc::new(HostCache::new(options.dns.host_cache_capacity));
        let persister = match (&options.storage_path, options.dns.persist_host_cache) {
            (Some(path), true) => {
                let persister = Arc::new(HostCachePersister::new(path, options.dns.persist_delay));
                if let Err(e) = persister.load_into(&host_cache) {
                    tracing::warn!(error = %e, "host cache restore failed");
                }
                Some(persister)
            }
            _ => None,
        };

        // Resolver stack: raw resolver, overrides, stale policy.
        let raw: Arc<dyn Resolve> = if options.dns.use_builtin_resolver {
            Arc::new(HickoryResolver::new())
        } else {
            Arc::new(GaiResolver::new())
        };
        let raw: Arc<dyn Resolve> = if options.dns.host_resolver_rules.is_empty() {
            raw
        } else {
            let overrides: HashMap<Cow<'static, str>, _> = options
                .dns
                .host_resolver_rules
                .iter()
                .map(|(host, addrs)| (Cow::Owned(host.clone()), addrs.clone()))
                .collect();
            Arc::new(DnsResolverWithOverrides::new(raw, overrides))
        };
        let stale_config = StaleResolverConfig {
            enable_stale: options.dns.enable_stale,
            fresh_lookup_timeout: options.dns.fresh_lookup_timeout,
            max_expired_delay: options.dns.max_expired_delay,
            allow_cross_network_usage: options.dns.allow_cross_network_usage,
            use_stale_on_name_not_resolved: options.dns.use_stale_on_name_not_resolved,
            preestablish_connections_to_stale_dns_results: options
                .dns
                .preestablish_connections_to_stale_dns_results,
            default_ttl: Duration::from_secs(60),
            source: if options.dns.use_builtin_resolver {
                EntrySource::Builtin
            } else {
                EntrySource::System
            },
        };
        let mut resolver = StaleHostResolver::new(
            raw,
            Arc::clone(&host_cache),
            stale_config,
            Arc::clone(&netlog),
        );

        // Security.
        let mut pins = PinStore::new();
        pins.set_bypass_for_local_trust_anchors(options.pinning_bypass_for_local_trust_anchors);
        for pin_set in &options.public_key_pins {
            pins.add(pin_set.clone());
        }

        // Session pool.
        let server_info = Arc::new(QuicServerInfoStore::new(
            options.quic.server_configs_cache_size,
            options.storage_path.as_deref(),
        ));
        let pool_config = PoolConfig {
            enable_http2: options.enable_http2,
            enable_quic: options.enable_quic,
            quic_hints: options.quic_hints.clone(),
            quic: options.quic.clone(),
            migration: options.migration.clone(),
            connect_timeout: options.connect_timeout,
            ..Default::default()
        };
        let pool = Arc::new(SessionPool::new(
            pool_config,
            pins,
            Arc::clone(&server_info),
            Arc::clone(&notifier),
            Arc::clone(&netlog),
        ));

        let runner = NetworkRunner::start().map_err(|_| NetError::Unexpected)?;

        // Stale-DNS pre-connection hints flow into the pool.
        if options.dns.preestablish_connections_to_stale_dns_results {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            resolver.set_preconnect_channel(tx);
            let pool_for_hints = Arc::clone(&pool);
            runner.spawn(async move {
                while let Some(hint) = rx.recv().await {
                    let key = SessionKey {
                        origin: crate::dns::Origin::new("https", &hint.host, 443),
                        binding: hint.binding,
                        privacy_mode: PrivacyMode::Disabled,
                    };
                    pool_for_hints.preconnect(&key, &hint.endpoints).await;
                }
            });
        }
        let resolver = Arc::new(resolver);

        // Network change plumbing: host cache flush policy and pool
        // housekeeping. QUIC sessions subscribe on their own.
        {
            let mut events = notifier.subscribe();
            let resolver = Arc::clone(&resolver);
            let pool_events = Arc::clone(&pool);
            runner.spawn(async move {
                while let Ok(event) = events.recv().await {
                    match event {
                        NetworkChangeEvent::DefaultNetworkChanged(_)
                        | NetworkChangeEvent::IpAddressChanged => {
                            resolver.on_network_change();
                            pool_events.on_default_network_changed();
                        }
                        NetworkChangeEvent::NetworkConnected(binding) => {
                            pool_events.set_alternate_network(Some(binding));
                        }
                        NetworkChangeEvent::NetworkDisconnected(_) => {
                            pool_events.set_alternate_network(None);
                        }
                    }
                }
            });
        }

        // Periodic host-cache persistence.
        if let Some(persister) = &persister {
            let persister = Arc::clone(persister);
            let host_cache_for_persist = Arc::clone(&host_cache);
            let delay = options.dns.persist_delay.max(Duration::from_secs(1));
            runner.spawn(async move {
                loop {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = persister.maybe_persist(&host_cache_for_persist) {
                        tracing::debug!(error = %e, "host cache persist failed");
                    }
                }
            });
        }

        // H1 keep-alive sweeping.
        {
            let h1 = Arc::clone(pool.h1());
            runner.spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    h1.cleanup_idle();
                }
            });
        }

        let in_flight = Arc::new(AtomicUsize::new(0));
        let bound_network = Arc::new(Mutex::new(options.bound_network));
        let listeners: Arc<Mutex<Vec<Arc<dyn RequestFinishedListener>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let ctx = Arc::new(RequestContext {
            resolver: Arc::clone(&resolver),
            pool: Arc::clone(&pool),
            cache: Arc::clone(&cache),
            netlog: Arc::clone(&netlog),
            user_agent: options.user_agent.clone(),
            enable_brotli: options.enable_brotli,
            max_redirects: options.max_redirects,
            request_timeout: options.request_timeout,
            bound_network: Arc::clone(&bound_network),
            listeners: Arc::clone(&listeners),
            in_flight: Arc::clone(&in_flight),
            runner_handle: runner.handle().clone(),
        });

        netlog.add_event(NetLogEventType::EngineCreated);

        Ok(Engine {
            inner: Arc::new(EngineInner {
                ctx,
                resolver,
                pool,
                cache,
                netlog,
                notifier,
                persister,
                host_cache,
                runner: Mutex::new(runner),
                in_flight,
                bound_network,
                listeners,
                allow_cross_network_dns: options.dns.allow_cross_network_usage,
            }),
        })
    }

    /// Create a request builder targeting `url`.
    pub fn new_request_builder(
        &self,
        url: &str,
        executor: Arc<dyn Executor>,
        callback: Arc<dyn UrlRequestCallback>,
    ) -> Result<UrlRequestBuilder, NetError> {
        let url = parse_request_url(url)?;
        Ok(UrlRequestBuilder::new(
            Arc::clone(&self.inner.ctx),
            url,
            executor,
            callback,
        ))
    }

    /// Create a bidirectional stream builder targeting `url`.
    pub fn new_bidirectional_stream_builder(
        &self,
        url: &str,
        executor: Arc<dyn Executor>,
        callback: Arc<dyn BidirectionalStreamCallback>,
    ) -> Result<BidirectionalStreamBuilder, NetError> {
        let url = parse_request_url(url)?;
        Ok(BidirectionalStreamBuilder::new(
            Arc::clone(&self.inner.ctx),
            url,
            executor,
            callback,
        ))
    }

    /// Pin future sockets to `binding`; `None` unbinds.
    pub fn bind_to_network(&self, binding: Option<NetworkBinding>) {
        *self.inner.bound_network.lock().unwrap() =
            binding.unwrap_or(NetworkBinding::UNBOUND);
    }

    pub fn bound_network(&self) -> NetworkBinding {
        *self.inner.bound_network.lock().unwrap()
    }

    /// Host OS integration point: feed network change events here.
    pub fn network_change_notifier(&self) -> &Arc<NetworkChangeNotifier> {
        &self.inner.notifier
    }

    pub fn add_request_finished_listener(&self, listener: Arc<dyn RequestFinishedListener>) {
        self.inner.listeners.lock().unwrap().push(listener);
    }

    pub fn start_net_log_to_file(
        &self,
        path: &Path,
        include_sensitive: bool,
    ) -> Result<(), NetError> {
        self.inner
            .netlog
            .start_to_file(path, include_sensitive)
            .map_err(|_| NetError::InvalidArgument("cannot open NetLog file".into()))
    }

    pub fn stop_net_log(&self) {
        self.inner.netlog.stop();
    }

    pub fn active_request_count(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Flush host-cache state on an externally observed network change
    /// without going through the notifier (test hook).
    pub fn flush_dns_on_network_change(&self) {
        self.inner
            .host_cache
            .on_network_change(self.inner.allow_cross_network_dns);
    }

    /// Shut down. Refused while requests are in flight. Drains pools,
    /// closes sockets, flushes persistence, and joins the network thread.
    pub fn shutdown(&self) -> Result<(), NetError> {
        if self.active_request_count() > 0 {
            return Err(NetError::InvalidArgument(
                "shutdown with requests in flight".into(),
            ));
        }

        self.inner.netlog.add_event(NetLogEventType::EngineShutdown);

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        {
            let pool = Arc::clone(&self.inner.pool);
            let cache = Arc::clone(&self.inner.cache);
            let persister = self.inner.persister.clone();
            let host_cache = Arc::clone(&self.inner.host_cache);
            let runner = self.inner.runner.lock().unwrap();
            if !runner.is_running() {
                return Ok(());
            }
            runner.spawn(async move {
                pool.shutdown().await;
                if let Some(persister) = persister {
                    if let Err(e) = persister.flush(&host_cache) {
                        tracing::warn!(error = %e, "host cache flush failed");
                    }
                }
                cache.close();
                let _ = done_tx.send(());
            });
        }
        let _ = done_rx.recv_timeout(Duration::from_secs(10));

        self.inner.runner.lock().unwrap().shutdown();
        self.inner.netlog.stop();
        Ok(())
    }

    #[doc(hidden)]
    pub fn resolver(&self) -> &Arc<StaleHostResolver> {
        &self.inner.resolver
    }
}

fn parse_request_url(url: &str) -> Result<Url, NetError> {
    let parsed = Url::parse(url).map_err(|_| NetError::InvalidUrl)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(NetError::UnknownUrlScheme),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        assert!(version_string().starts_with("corenet/"));
    }

    #[test]
    fn test_parse_request_url() {
        assert!(parse_request_url("http://example.com/").is_ok());
        assert!(parse_request_url("https://example.com/").is_ok());
        assert_eq!(
            parse_request_url("ftp://example.com/").unwrap_err(),
            NetError::UnknownUrlScheme
        );
        assert_eq!(
            parse_request_url("not a url").unwrap_err(),
            NetError::InvalidUrl
        );
    }

    #[test]
    fn test_misconfigured_migration_rejected_at_build() {
        let mut builder = Engine::builder();
        builder.options_mut().migration.allow_non_default_network_usage = true;
        builder.options_mut().migration.path_degradation_migration = false;
        let err = builder.build().unwrap_err();
        assert_eq!(err, NetError::InvalidArgument(String::new()));
    }

    #[test]
    fn test_build_and_shutdown() {
        let engine = Engine::builder().build().unwrap();
        assert_eq!(engine.active_request_count(), 0);
        assert_eq!(engine.bound_network(), NetworkBinding::UNBOUND);
        engine.shutdown().unwrap();
    }

    #[test]
    fn test_bind_to_network() {
        let engine = Engine::builder().build().unwrap();
        let wifi = NetworkBinding::from_handle(7);
        engine.bind_to_network(Some(wifi));
        assert_eq!(engine.bound_network(), wifi);
        engine.bind_to_network(None);
        assert_eq!(engine.bound_network(), NetworkBinding::UNBOUND);
        engine.shutdown().unwrap();
    }
}
