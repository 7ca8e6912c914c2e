//! System DNS resolver using getaddrinfo.
//!
//! Uses the operating system's native DNS resolution via `getaddrinfo`,
//! executed in a thread pool to avoid blocking the async runtime. Used
//! when the builder opts out of the built-in resolver.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::neterror::{NetError, NetResultExt};
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
};

/// System DNS resolver using `getaddrinfo` in a thread pool.
///
/// Wraps the standard library's `ToSocketAddrs` and executes resolution
/// in `tokio::task::spawn_blocking`. Each resolution spawns a blocking
/// task; for high-throughput scenarios prefer `HickoryResolver`.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    /// Creates a new `GaiResolver`.
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let domain = host.clone();

            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            // Handle task join error (cancellation, panic)
            let addrs = result
                .map_err(|e| {
                    tracing::error!(error = %e, "DNS resolution task failed");
                    NetError::NameNotResolved
                })?
                .for_domain(&domain)?;

            if addrs.is_empty() {
                return Err(NetError::NameNotResolvedFor {
                    domain,
                    source: std::sync::Arc::new(io::Error::new(
                        io::ErrorKind::NotFound,
                        "No addresses returned by getaddrinfo",
                    )),
                });
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "DNS resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Utility for parsing IP address strings directly.
///
/// Bypasses DNS resolution if the host is already an IP address.
pub struct SocketAddrs {
    addrs: Vec<SocketAddr>,
}

impl SocketAddrs {
    /// Creates a new `SocketAddrs` from a vector.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    /// Attempts to parse a host string as an IP address.
    ///
    /// Returns `Some` if the host is a valid IPv4 or IPv6 address,
    /// `None` if it's a hostname that requires DNS resolution.
    pub fn try_parse(host: &str, port: u16) -> Option<Self> {
        if let Ok(addr) = host.parse::<Ipv4Addr>() {
            return Some(Self {
                addrs: vec![SocketAddr::V4(SocketAddrV4::new(addr, port))],
            });
        }

        if let Ok(addr) = host.parse::<Ipv6Addr>() {
            return Some(Self {
                addrs: vec![SocketAddr::V6(SocketAddrV6::new(addr, port, 0, 0))],
            });
        }

        None
    }

    /// Returns true if no addresses are available.
    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    /// Returns the number of addresses.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Consume into the underlying vector.
    pub fn into_vec(self) -> Vec<SocketAddr> {
        self.addrs
    }
}

impl Iterator for SocketAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.addrs.is_empty() {
            None
        } else {
            Some(self.addrs.remove(0))
        }
    }
}
