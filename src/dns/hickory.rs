//! Built-in async DNS resolver backed by hickory-dns.
//!
//! This is the resolver selected by `use_builtin_resolver`. Unlike
//! `GaiResolver` it is fully async, auto-detects system DNS
//! configuration, and does dual-stack lookups in one query.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::neterror::NetError;
use hickory_resolver::{
    config::{LookupIpStrategy, ResolverConfig},
    name_server::TokioConnectionProvider,
    TokioResolver,
};
use std::{net::SocketAddr, sync::LazyLock};

/// Async DNS resolver backed by hickory-dns.
///
/// The underlying resolver is lazily initialized on first use and shared
/// across all instances via a static `LazyLock`. It reads system DNS
/// settings when available and falls back to defaults otherwise.
#[derive(Debug, Clone)]
pub struct HickoryResolver {
    resolver: &'static LazyLock<TokioResolver>,
}

impl HickoryResolver {
    /// Creates a new `HickoryResolver`.
    pub fn new() -> Self {
        static RESOLVER: LazyLock<TokioResolver> = LazyLock::new(|| {
            let mut builder = match TokioResolver::builder_tokio() {
                Ok(builder) => {
                    tracing::debug!("Using system DNS configuration");
                    builder
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Failed to read system DNS config, using defaults"
                    );
                    TokioResolver::builder_with_config(
                        ResolverConfig::default(),
                        TokioConnectionProvider::default(),
                    )
                }
            };

            // Dual-stack so the happy-eyeballs dial has both families
            builder.options_mut().ip_strategy = LookupIpStrategy::Ipv4AndIpv6;

            builder.build()
        });

        Self {
            resolver: &RESOLVER,
        }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolve for HickoryResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let domain = name.as_str();
            tracing::debug!(domain = %domain, "resolving via hickory-dns");

            let lookup = resolver.resolver.lookup_ip(domain).await.map_err(|e| {
                tracing::debug!(domain = %domain, error = %e, "hickory-dns lookup failed");
                NetError::NameNotResolvedFor {
                    domain: domain.to_string(),
                    source: std::sync::Arc::new(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        e.to_string(),
                    )),
                }
            })?;

            let addrs: Vec<SocketAddr> = lookup.iter().map(|ip| SocketAddr::new(ip, 0)).collect();

            if addrs.is_empty() {
                return Err(NetError::NameNotResolvedFor {
                    domain: domain.to_string(),
                    source: std::sync::Arc::new(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "No addresses returned",
                    )),
                });
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "hickory-dns resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}
