//! Host resolution.
//!
//! The `Resolve` trait is the low-level seam (system `getaddrinfo` or the
//! built-in hickory resolver); `StaleHostResolver` layers the TTL-aware
//! host cache and the stale-while-revalidate policy on top of it.

pub mod gai;
pub mod hickory;
pub mod host_cache;
pub mod persist;
pub mod stale;

pub use gai::GaiResolver;
pub use hickory::HickoryResolver;
pub use host_cache::{EntrySource, Freshness, HostCache, HostCacheEntry, HostCacheKey};
pub use persist::HostCachePersister;
pub use stale::{PreconnectHint, StaleHostResolver, StaleResolverConfig};

use crate::base::neterror::NetError;
use std::{
    borrow::Cow, collections::HashMap, fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc,
};

/// A domain name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from any string-like type.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Address family requested by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressFamily {
    /// Both families; IPv6 endpoints ordered first.
    #[default]
    Unspecified,
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// True if `addr` belongs to this family.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Unspecified => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }

    /// Filter and order endpoints: drop non-matching families, put IPv6
    /// first for unspecified lookups.
    pub fn select(&self, addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        match self {
            AddressFamily::Unspecified => {
                let (mut v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv6());
                v6.extend(v4);
                v6
            }
            _ => addrs.into_iter().filter(|a| self.matches(a)).collect(),
        }
    }
}

/// Scheme/host/port triple used as the primary identity for connection
/// reuse. Host comparison is case-insensitive (stored lowercased).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: &str, host: &str, port: u16) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn from_url(url: &url::Url) -> Result<Self, NetError> {
        let host = url.host_str().ok_or(NetError::InvalidUrl)?;
        let port = url.port_or_known_default().ok_or(NetError::InvalidUrl)?;
        Ok(Self::new(url.scheme(), host, port))
    }

    pub fn is_https(&self) -> bool {
        self.scheme == "https"
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Trait for DNS resolution.
///
/// Implementations must be thread-safe; resolution uses `&self` so a
/// single resolver serves concurrent lookups.
pub trait Resolve: Send + Sync {
    /// Resolves a domain name to IP addresses.
    ///
    /// The returned addresses have port 0; callers set the appropriate
    /// port for the target service.
    fn resolve(&self, name: Name) -> Resolving;
}

/// Blanket implementation for Arc-wrapped resolvers.
impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// DNS resolver wrapper that supports hostname overrides.
///
/// Checks a map of hostname-to-address overrides before falling back to
/// the underlying resolver. Backs the engine's host-resolver rules and
/// doubles as the test seam for everything above the resolver.
pub struct DnsResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: Arc<HashMap<Cow<'static, str>, Vec<SocketAddr>>>,
}

impl DnsResolverWithOverrides {
    pub fn new(
        inner: Arc<dyn Resolve>,
        overrides: HashMap<Cow<'static, str>, Vec<SocketAddr>>,
    ) -> Self {
        Self {
            inner,
            overrides: Arc::new(overrides),
        }
    }

    /// Returns the number of configured overrides.
    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.overrides.get(name.as_str()) {
            let addrs: Addrs = Box::new(addrs.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        self.inner.resolve(name)
    }
}

impl fmt::Debug for DnsResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolverWithOverrides")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_name_api() {
        let name = Name::from("example.com");
        assert_eq!(name.as_str(), "example.com");
        assert_eq!(name.to_string(), "example.com");
    }

    #[test]
    fn test_origin_case_insensitive_host() {
        let a = Origin::new("https", "Example.COM", 443);
        let b = Origin::new("https", "example.com", 443);
        assert_eq!(a, b);
    }

    #[test]
    fn test_origin_from_url_default_port() {
        let url = url::Url::parse("https://example.com/path").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.port, 443);
        assert!(origin.is_https());
    }

    #[test]
    fn test_family_select_orders_v6_first() {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 0);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0);
        let out = AddressFamily::Unspecified.select(vec![v4, v6]);
        assert_eq!(out, vec![v6, v4]);

        let only_v4 = AddressFamily::Ipv4.select(vec![v4, v6]);
        assert_eq!(only_v4, vec![v4]);
    }

    struct MockResolver {
        response: Vec<SocketAddr>,
    }

    impl Resolve for MockResolver {
        fn resolve(&self, _name: Name) -> Resolving {
            let addrs = self.response.clone();
            Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) })
        }
    }

    #[tokio::test]
    async fn test_override_resolver_hit_and_miss() {
        let mock = Arc::new(MockResolver {
            response: vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 0)],
        });

        let mut overrides = HashMap::new();
        overrides.insert(
            Cow::Borrowed("override.local"),
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0)],
        );

        let resolver = DnsResolverWithOverrides::new(mock, overrides);

        let addrs: Vec<_> = resolver
            .resolve(Name::new("override.local"))
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));

        let addrs: Vec<_> = resolver
            .resolve(Name::new("not-overridden.com"))
            .await
            .unwrap()
            .collect();
        assert_eq!(addrs[0].ip(), IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
