//! Typed engine options.
//!
//! These structures are the ground truth for configuration. The JSON
//! experimental-options surface (`engine::experimental`) is an adapter
//! writing into them; nothing reads the JSON after build.

use crate::base::network::NetworkBinding;
use crate::cache::CacheMode;
use crate::pool::QuicHint;
use crate::quic::{MigrationConfig, QuicConfig};
use crate::security::pinning::PinSet;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// DNS resolver options.
#[derive(Debug, Clone)]
pub struct DnsOptions {
    /// Built-in (hickory) resolver vs system getaddrinfo.
    pub use_builtin_resolver: bool,
    pub enable_stale: bool,
    /// Wait this long for a fresh answer before yielding stale. Zero
    /// yields immediately and refreshes in the background.
    pub fresh_lookup_timeout: Duration,
    /// Stale eligibility bound past TTL. Zero = unbounded.
    pub max_expired_delay: Duration,
    pub allow_cross_network_usage: bool,
    pub use_stale_on_name_not_resolved: bool,
    pub persist_host_cache: bool,
    pub persist_delay: Duration,
    pub preestablish_connections_to_stale_dns_results: bool,
    /// Hostname overrides (hosts-file style); also the test seam.
    pub host_resolver_rules: HashMap<String, Vec<SocketAddr>>,
    pub host_cache_capacity: usize,
}

impl Default for DnsOptions {
    fn default() -> Self {
        Self {
            use_builtin_resolver: true,
            enable_stale: false,
            fresh_lookup_timeout: Duration::from_millis(250),
            max_expired_delay: Duration::from_secs(3600),
            allow_cross_network_usage: false,
            use_stale_on_name_not_resolved: false,
            persist_host_cache: false,
            persist_delay: Duration::from_secs(60),
            preestablish_connections_to_stale_dns_results: false,
            host_resolver_rules: HashMap::new(),
            host_cache_capacity: 1000,
        }
    }
}

/// Everything an engine is built from.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub user_agent: String,
    pub storage_path: Option<PathBuf>,

    pub enable_http2: bool,
    pub enable_quic: bool,
    pub enable_brotli: bool,
    pub quic_hints: Vec<QuicHint>,

    pub quic: QuicConfig,
    pub migration: MigrationConfig,
    pub dns: DnsOptions,

    pub cache_mode: CacheMode,
    pub cache_max_size: usize,

    pub public_key_pins: Vec<PinSet>,
    pub pinning_bypass_for_local_trust_anchors: bool,

    pub max_redirects: u32,
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,

    /// Network requests are pinned to at build time (rebindable later).
    pub bound_network: NetworkBinding,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            storage_path: None,
            enable_http2: true,
            enable_quic: false,
            enable_brotli: false,
            quic_hints: Vec::new(),
            quic: QuicConfig::default(),
            migration: MigrationConfig::default(),
            dns: DnsOptions::default(),
            cache_mode: CacheMode::Disabled,
            cache_max_size: 0,
            public_key_pins: Vec::new(),
            pinning_bypass_for_local_trust_anchors: true,
            max_redirects: crate::request::job::DEFAULT_MAX_REDIRECTS,
            connect_timeout: crate::pool::connect_job::DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            bound_network: NetworkBinding::UNBOUND,
        }
    }
}

/// Default user agent, `corenet/<version>`.
pub fn default_user_agent() -> String {
    format!("corenet/{}", env!("CARGO_PKG_VERSION"))
}
