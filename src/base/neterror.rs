//! Engine error taxonomy.
//!
//! Every failure surfaced by the engine carries a stable negative numeric
//! code (Chromium net-error numbering) plus a handling category that the
//! request machinery uses to decide between transparent retry, policy
//! retry, and surfacing the error to the caller.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// How a failure is handled by the layers above the one that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retried on a fresh stream/session without surfacing to the caller
    /// (e.g. HTTP/2 REFUSED_STREAM, reset on a reused socket before any
    /// request bytes were sent).
    RetryableTransparent,
    /// Retried once under an explicit option (e.g. pre-handshake errors
    /// retried on the alternate network).
    RetryablePolicy,
    /// Fails the stream; surfaced via `on_failed`.
    FatalToStream,
    /// Closes the whole session; all of its streams fail; the pool purges it.
    FatalToSession,
    /// Invariant violation. Logged; the engine keeps serving other requests.
    FatalToEngine,
}

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Resolution
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("DNS resolution failed for {domain}: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },

    // Connection
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Internet disconnected")]
    InternetDisconnected,
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Preconnect max socket limit")]
    PreconnectMaxSocketLimit,

    // TLS
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("ALPN negotiation failed")]
    AlpnNegotiationFailed,
    #[error("SSL pinned key not in cert chain")]
    SslPinnedKeyNotInCertChain,
    #[error("TLS early data rejected")]
    EarlyDataRejected,

    // Timeouts and environment
    #[error("Operation timed out")]
    TimedOut,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Network changed")]
    NetworkChanged,
    #[error("Request canceled")]
    Aborted,
    #[error("Internal error")]
    Unexpected,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Insufficient resources")]
    InsufficientResources,
    #[error("Temporarily throttled")]
    TemporarilyThrottled,

    // HTTP
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Unknown URL scheme")]
    UnknownUrlScheme,
    #[error("Invalid redirect")]
    InvalidRedirect,
    #[error("Too many redirects")]
    TooManyRedirects,
    #[error("Redirect cycle detected")]
    RedirectCycleDetected,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,
    #[error("Content decoding failed")]
    ContentDecodingFailed,
    #[error("Too many retries")]
    TooManyRetries,
    #[error("Cache miss")]
    CacheMiss,
    #[error("Cache open failure")]
    CacheOpenFailure,

    // HTTP/2
    #[error("HTTP/2 protocol error")]
    Http2ProtocolError,
    #[error("HTTP/2 server refused stream")]
    Http2ServerRefusedStream,
    #[error("HTTP/2 ping failed")]
    Http2PingFailed,
    #[error("HTTP/2 stream closed")]
    Http2StreamClosed,

    // QUIC
    #[error("QUIC protocol error")]
    QuicProtocolError,
    #[error("QUIC handshake failed")]
    QuicHandshakeFailed,

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    /// Stable numeric code (Chromium net-error numbering).
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Aborted => -3,
            NetError::InvalidArgument(_) => -4,
            NetError::TimedOut => -7,
            NetError::Unexpected => -9,
            NetError::InsufficientResources => -12,
            NetError::NetworkChanged => -21,

            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionAborted => -103,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::InternetDisconnected => -106,
            NetError::SslProtocolError => -107,
            NetError::AddressUnreachable => -109,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::AlpnNegotiationFailed => -122,
            NetError::PreconnectMaxSocketLimit => -133,
            NetError::TemporarilyThrottled => -139,
            NetError::SslPinnedKeyNotInCertChain => -150,
            NetError::EarlyDataRejected => -178,

            NetError::InvalidUrl => -300,
            NetError::UnknownUrlScheme => -302,
            NetError::InvalidRedirect => -303,
            NetError::TooManyRedirects => -310,
            NetError::EmptyResponse => -324,
            NetError::ResponseHeadersTooBig => -325,
            NetError::ContentDecodingFailed => -330,
            NetError::Http2ProtocolError => -337,
            NetError::Http2ServerRefusedStream => -351,
            NetError::Http2PingFailed => -352,
            NetError::ContentLengthMismatch => -354,
            NetError::QuicProtocolError => -356,
            NetError::QuicHandshakeFailed => -358,
            NetError::InvalidHttpResponse => -370,
            NetError::TooManyRetries => -375,
            NetError::Http2StreamClosed => -376,

            NetError::CacheMiss => -400,
            NetError::CacheOpenFailure => -401,
            NetError::RedirectCycleDetected => -900,

            NetError::Unknown(code) => *code,
        }
    }

    /// Handling category per the engine's retry/fallback policy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetError::Http2ServerRefusedStream
            | NetError::ConnectionReset
            | NetError::ConnectionClosed
            | NetError::SocketNotConnected
            | NetError::EmptyResponse
            | NetError::EarlyDataRejected => ErrorCategory::RetryableTransparent,

            NetError::QuicHandshakeFailed => ErrorCategory::RetryablePolicy,

            NetError::Http2ProtocolError
            | NetError::Http2PingFailed
            | NetError::QuicProtocolError
            | NetError::NetworkChanged => ErrorCategory::FatalToSession,

            NetError::Unexpected => ErrorCategory::FatalToEngine,

            _ => ErrorCategory::FatalToStream,
        }
    }

    /// True if the request layer may transparently retry on a fresh
    /// stream, provided no request body bytes were sent yet.
    pub fn is_retryable_transparent(&self) -> bool {
        self.category() == ErrorCategory::RetryableTransparent
    }

    /// Context-rich constructor for connection failures.
    pub fn connection_failed_to(host: &str, port: u16, source: io::Error) -> Self {
        NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            source: Arc::new(source),
        }
    }

    /// Context-rich constructor for DNS failures.
    pub fn dns_failed(domain: &str, source: io::Error) -> Self {
        NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(source),
        }
    }
}

/// Context-adding conversions for IO results at the engine's socket and
/// resolver seams. The enriched variants keep the plain variant's code,
/// so retry classification is unaffected.
pub trait NetResultExt<T> {
    /// Tag a dial failure with the peer it was for.
    ///
    /// ```ignore
    /// let stream = TcpStream::connect(addr).await.for_peer(host, 443)?;
    /// // Error: "Connection to example.com:443 failed: connection refused"
    /// ```
    fn for_peer(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Tag a resolution failure with the domain that was queried.
    fn for_domain(self, domain: &str) -> Result<T, NetError>;
}

impl<T> NetResultExt<T> for Result<T, io::Error> {
    fn for_peer(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| NetError::connection_failed_to(host, port, e))
    }

    fn for_domain(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::dns_failed(domain, e))
    }
}

// Codes are the identity; context variants compare equal to their plain
// counterparts so retry classification survives context enrichment.
impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        self.as_i32() == other.as_i32()
    }
}

impl Eq for NetError {}

impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -3 => NetError::Aborted,
            -7 => NetError::TimedOut,
            -9 => NetError::Unexpected,
            -12 => NetError::InsufficientResources,
            -21 => NetError::NetworkChanged,
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -103 => NetError::ConnectionAborted,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -106 => NetError::InternetDisconnected,
            -107 => NetError::SslProtocolError,
            -109 => NetError::AddressUnreachable,
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -122 => NetError::AlpnNegotiationFailed,
            -133 => NetError::PreconnectMaxSocketLimit,
            -139 => NetError::TemporarilyThrottled,
            -150 => NetError::SslPinnedKeyNotInCertChain,
            -178 => NetError::EarlyDataRejected,
            -300 => NetError::InvalidUrl,
            -302 => NetError::UnknownUrlScheme,
            -303 => NetError::InvalidRedirect,
            -310 => NetError::TooManyRedirects,
            -324 => NetError::EmptyResponse,
            -325 => NetError::ResponseHeadersTooBig,
            -330 => NetError::ContentDecodingFailed,
            -337 => NetError::Http2ProtocolError,
            -351 => NetError::Http2ServerRefusedStream,
            -352 => NetError::Http2PingFailed,
            -354 => NetError::ContentLengthMismatch,
            -356 => NetError::QuicProtocolError,
            -358 => NetError::QuicHandshakeFailed,
            -370 => NetError::InvalidHttpResponse,
            -375 => NetError::TooManyRetries,
            -376 => NetError::Http2StreamClosed,
            -400 => NetError::CacheMiss,
            -401 => NetError::CacheOpenFailure,
            -900 => NetError::RedirectCycleDetected,
            _ => NetError::Unknown(code),
        }
    }
}
