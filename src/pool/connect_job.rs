//! Connection establishment: TCP dial with Happy Eyeballs, TLS, ALPN.
//!
//! A `ConnectJob` turns resolved endpoints into a connected (and for
//! https, TLS-protected) socket. Pins are verified right after the
//! handshake, before the socket is handed to any HTTP codec, so no
//! request bytes can reach a mis-pinned peer.

use crate::base::neterror::{NetError, NetResultExt};
use crate::base::network::NetworkBinding;
use crate::dns::Origin;
use crate::security::pinning::{spki_hash_of, PinStore, SpkiHash};
use boring::ssl::{SslConnector, SslMethod};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

/// Happy Eyeballs IPv6 fallback delay (RFC 8305).
const IPV6_FALLBACK_DELAY: Duration = Duration::from_millis(250);

/// Default connection timeout when the request sets none.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(240);

/// Protocol negotiated on the connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    Http1,
    H2,
}

/// A connected transport socket, TLS-wrapped for https origins.
pub enum ConnectedSocket {
    Tls(SslStream<TcpStream>),
    Plain(TcpStream),
}

impl AsyncRead for ConnectedSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnectedSocket::Tls(s) => Pin::new(s).poll_read(cx, buf),
            ConnectedSocket::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnectedSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ConnectedSocket::Tls(s) => Pin::new(s).poll_write(cx, buf),
            ConnectedSocket::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnectedSocket::Tls(s) => Pin::new(s).poll_flush(cx),
            ConnectedSocket::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnectedSocket::Tls(s) => Pin::new(s).poll_shutdown(cx),
            ConnectedSocket::Plain(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Result of a connection attempt.
pub struct ConnectResult {
    pub socket: ConnectedSocket,
    pub negotiated: NegotiatedProtocol,
    /// SPKI hashes of the served chain (https only).
    pub spki_hashes: Vec<SpkiHash>,
    pub remote_addr: SocketAddr,
}

/// Tuning for a single connection attempt.
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// Offer h2 in ALPN.
    pub enable_http2: bool,
    /// Network the socket should be pinned to. The engine records the
    /// binding; actually pinning the fd is delegated to the host OS
    /// integration (SO_BINDTODEVICE or equivalent).
    pub binding: NetworkBinding,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            enable_http2: true,
            binding: NetworkBinding::UNBOUND,
        }
    }
}

/// Manages the connection process: TCP -> TLS -> pin check.
pub struct ConnectJob;

impl ConnectJob {
    /// Connect to `origin` using already-resolved `endpoints`.
    pub async fn connect(
        origin: &Origin,
        endpoints: &[SocketAddr],
        pins: &PinStore,
        opts: &ConnectOptions,
    ) -> Result<ConnectResult, NetError> {
        if endpoints.is_empty() {
            return Err(NetError::NameNotResolved);
        }

        let with_port: Vec<SocketAddr> = endpoints
            .iter()
            .map(|addr| SocketAddr::new(addr.ip(), origin.port))
            .collect();

        let tcp = Self::connect_with_happy_eyeballs(&with_port, opts.connect_timeout).await?;
        let remote_addr = tcp.peer_addr().for_peer(&origin.host, origin.port)?;

        if !origin.is_https() {
            return Ok(ConnectResult {
                socket: ConnectedSocket::Plain(tcp),
                negotiated: NegotiatedProtocol::Http1,
                spki_hashes: Vec::new(),
                remote_addr,
            });
        }

        let (tls, negotiated) = Self::ssl_handshake(tcp, &origin.host, opts.enable_http2).await?;

        // Collect the served chain's SPKI hashes and enforce pins before
        // the socket carries a single request byte.
        let mut spki_hashes = Vec::new();
        if let Some(chain) = tls.ssl().peer_cert_chain() {
            for cert in chain {
                spki_hashes.push(spki_hash_of(cert)?);
            }
        }
        pins.check(&origin.host, &spki_hashes, false)?;

        Ok(ConnectResult {
            socket: ConnectedSocket::Tls(tls),
            negotiated,
            spki_hashes,
            remote_addr,
        })
    }

    /// Connect using Happy Eyeballs (RFC 8305): IPv6 first, IPv4 after a
    /// short fallback delay, first success wins.
    async fn connect_with_happy_eyeballs(
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<TcpStream, NetError> {
        let (ipv6_addrs, ipv4_addrs): (Vec<_>, Vec<_>) =
            addrs.iter().partition(|a| matches!(a.ip(), IpAddr::V6(_)));

        if ipv6_addrs.is_empty() {
            return Self::connect_any(&ipv4_addrs, timeout).await;
        }
        if ipv4_addrs.is_empty() {
            return Self::connect_any(&ipv6_addrs, timeout).await;
        }

        tokio::select! {
            result = Self::connect_any(&ipv6_addrs, timeout) => {
                match result {
                    Ok(stream) => Ok(stream),
                    Err(_) => Self::connect_any(&ipv4_addrs, timeout).await,
                }
            }
            result = async {
                tokio::time::sleep(IPV6_FALLBACK_DELAY).await;
                Self::connect_any(&ipv4_addrs, timeout).await
            } => {
                result
            }
        }
    }

    async fn connect_any(
        addrs: &[&SocketAddr],
        timeout: Duration,
    ) -> Result<TcpStream, NetError> {
        let mut last_error = NetError::ConnectionFailed;
        for addr in addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    last_error = NetError::connection_failed_to(&addr.ip().to_string(), addr.port(), e)
                }
                Err(_) => last_error = NetError::ConnectionTimedOut,
            }
        }
        Err(last_error)
    }

    /// SSL handshake; ALPN decides HTTP/1.1 vs HTTP/2.
    async fn ssl_handshake(
        stream: TcpStream,
        host: &str,
        enable_http2: bool,
    ) -> Result<(SslStream<TcpStream>, NegotiatedProtocol), NetError> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).map_err(|_| NetError::SslProtocolError)?;

        let protos: &[u8] = if enable_http2 {
            b"\x02h2\x08http/1.1"
        } else {
            b"\x08http/1.1"
        };
        builder
            .set_alpn_protos(protos)
            .map_err(|_| NetError::SslProtocolError)?;

        let connector = builder.build();
        let config = connector
            .configure()
            .map_err(|_| NetError::SslProtocolError)?;

        let tls_stream = tokio_boring::connect(config, host, stream).await.map_err(|e| {
            tracing::debug!(host, error = ?e, "TLS handshake failed");
            NetError::SslProtocolError
        })?;

        let negotiated = match tls_stream.ssl().selected_alpn_protocol() {
            Some(b"h2") => NegotiatedProtocol::H2,
            _ => NegotiatedProtocol::Http1,
        };
        Ok((tls_stream, negotiated))
    }
}
