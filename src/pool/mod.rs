//! Transport session pool.
//!
//! One bucket per (origin, network binding, privacy mode). A bucket
//! holds at most one multiplexed session (HTTP/2 or HTTP/3) plus a small
//! pool of HTTP/1.1 connections. Stream acquisition prefers an existing
//! multiplexed session, then an idle H1 connection, then dials —
//! transport chosen by QUIC hints, learned Alt-Svc, or ALPN on a TCP
//! happy-eyeballs dial.

pub mod connect_job;
pub mod h1;
pub mod session;

use crate::base::netlog::{NetLog, NetLogEventType};
use crate::base::neterror::NetError;
use crate::base::network::{NetworkBinding, NetworkChangeNotifier};
use crate::dns::Origin;
use crate::h2session::{H2Session, H2Stream};
use crate::quic::{
    MigrationConfig, QuicConfig, QuicServerInfoStore, QuicSession, QuicSessionParams,
};
use crate::security::pinning::PinStore;
use connect_job::{ConnectJob, ConnectOptions, NegotiatedProtocol};
use dashmap::DashMap;
use h1::{H1Connection, H1Pool, H1PoolConfig};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Request body type shared by every transport.
pub type OutboundBody = http_body_util::Full<bytes::Bytes>;

/// Request priority (matches Chromium's RequestPriority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RequestPriority {
    Throttled = 0,
    Idle = 1,
    Lowest = 2,
    Low = 3,
    #[default]
    Medium = 4,
    Highest = 5,
}

/// Credential separation for session reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrivacyMode {
    #[default]
    Disabled,
    Enabled,
}

/// Identity of a session bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub origin: Origin,
    pub binding: NetworkBinding,
    pub privacy_mode: PrivacyMode,
}

/// Static hint that an origin speaks HTTP/3.
#[derive(Debug, Clone)]
pub struct QuicHint {
    pub host: String,
    pub port: u16,
    pub alternate_port: u16,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enable_http2: bool,
    pub enable_quic: bool,
    pub quic_hints: Vec<QuicHint>,
    pub h1: H1PoolConfig,
    pub quic: QuicConfig,
    pub migration: MigrationConfig,
    pub connect_timeout: Duration,
    pub max_concurrent_h2_streams: usize,
    pub drain_deadline: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enable_http2: true,
            enable_quic: false,
            quic_hints: Vec::new(),
            h1: H1PoolConfig::default(),
            quic: QuicConfig::default(),
            migration: MigrationConfig::default(),
            connect_timeout: connect_job::DEFAULT_CONNECT_TIMEOUT,
            max_concurrent_h2_streams: crate::h2session::DEFAULT_MAX_CONCURRENT_STREAMS,
            drain_deadline: crate::h2session::DEFAULT_DRAIN_DEADLINE,
        }
    }
}

/// A stream handed to the request layer.
pub enum HttpStream {
    H1(H1Connection),
    H2(H2Stream),
    H3(crate::quic::H3Stream),
}

impl HttpStream {
    pub fn negotiated_protocol(&self) -> &'static str {
        match self {
            HttpStream::H1 { .. } => "http/1.1",
            HttpStream::H2(_) => "h2",
            HttpStream::H3(_) => "h3",
        }
    }

    pub fn is_reused(&self) -> bool {
        match self {
            HttpStream::H1(conn) => conn.reused,
            // Multiplexed streams ride an established session.
            HttpStream::H2(_) | HttpStream::H3(_) => true,
        }
    }
}

enum MuxEntry {
    H2(Arc<H2Session>),
    H3(Arc<QuicSession>),
}

#[derive(Debug)]
struct BrokenQuic {
    until: Instant,
    consecutive: u32,
}

/// Session pool shared by all requests of an engine.
pub struct SessionPool {
    config: PoolConfig,
    pins: PinStore,
    mux: DashMap<SessionKey, MuxEntry>,
    h1: Arc<H1Pool>,
    dial_latches: DashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>,
    server_info: Arc<QuicServerInfoStore>,
    notifier: Arc<NetworkChangeNotifier>,
    netlog: Arc<NetLog>,
    broken_quic: DashMap<Origin, BrokenQuic>,
    /// h3 ports learned from Alt-Svc response headers.
    alt_svc_h3: DashMap<Origin, u16>,
    alternate_network: Mutex<Option<NetworkBinding>>,
}

impl SessionPool {
    pub fn new(
        config: PoolConfig,
        pins: PinStore,
        server_info: Arc<QuicServerInfoStore>,
        notifier: Arc<NetworkChangeNotifier>,
        netlog: Arc<NetLog>,
    ) -> Self {
        let h1 = Arc::new(H1Pool::new(config.h1.clone()));
        Self {
            config,
            pins,
            mux: DashMap::new(),
            h1,
            dial_latches: DashMap::new(),
            server_info,
            notifier,
            netlog,
            broken_quic: DashMap::new(),
            alt_svc_h3: DashMap::new(),
            alternate_network: Mutex::new(None),
        }
    }

    pub fn h1(&self) -> &Arc<H1Pool> {
        &self.h1
    }

    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    /// Acquire a stream for `key`, preferring (a) an active multiplexed
    /// session below its stream cap, (b) an idle H1 connection, (c) a
    /// fresh dial. Establishment is serialized per key.
    pub async fn acquire_stream(
        &self,
        key: &SessionKey,
        endpoints: &[SocketAddr],
        is_http3_acceptable: bool,
        priority: RequestPriority,
    ) -> Result<HttpStream, NetError> {
        if let Some(stream) = self.try_existing(key) {
            return Ok(stream);
        }

        // At-most-one concurrent establishment per key.
        let latch = self
            .dial_latches
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = latch.lock().await;

        // A waiter may find the session the winner just created.
        if let Some(stream) = self.try_existing(key) {
            return Ok(stream);
        }

        self.establish(key, endpoints, is_http3_acceptable, priority)
            .await
    }

    fn try_existing(&self, key: &SessionKey) -> Option<HttpStream> {
        if let Some(entry) = self.mux.get(key) {
            match entry.value() {
                MuxEntry::H2(session) => {
                    if session.state() == session::SessionState::Closed {
                        drop(entry);
                        self.mux.remove(key);
                    } else if let Some(stream) = session.try_acquire_stream() {
                        return Some(HttpStream::H2(stream));
                    }
                }
                MuxEntry::H3(session) => {
                    if session.state() == session::SessionState::Closed {
                        drop(entry);
                        self.mux.remove(key);
                    } else if let Some(stream) = session.try_acquire_stream() {
                        return Some(HttpStream::H3(stream));
                    }
                }
            }
        }

        self.h1.take_idle(key).map(HttpStream::H1)
    }

    async fn establish(
        &self,
        key: &SessionKey,
        endpoints: &[SocketAddr],
        is_http3_acceptable: bool,
        priority: RequestPriority,
    ) -> Result<HttpStream, NetError> {
        // QUIC first when hinted and not in a broken-service window.
        if is_http3_acceptable
            && self.config.enable_quic
            && key.origin.is_https()
            && !self.is_quic_broken(&key.origin)
        {
            if let Some(port) = self.quic_candidate_port(&key.origin) {
                match self.dial_quic(key, endpoints, port).await {
                    Ok(session) => {
                        let stream = session
                            .try_acquire_stream()
                            .ok_or(NetError::QuicProtocolError)?;
                        self.mux.insert(key.clone(), MuxEntry::H3(session));
                        return Ok(HttpStream::H3(stream));
                    }
                    Err(err) => {
                        tracing::debug!(origin = %key.origin, error = %err, "QUIC dial failed, falling back to TCP");
                        self.mark_quic_broken(&key.origin);
                    }
                }
            }
        }

        // TCP dial; ALPN decides H1 vs H2.
        let permit = self.h1.begin_dial(key, priority).await?;
        let opts = ConnectOptions {
            connect_timeout: self.config.connect_timeout,
            enable_http2: self.config.enable_http2,
            binding: key.binding,
        };
        let result = match ConnectJob::connect(&key.origin, endpoints, &self.pins, &opts).await {
            Ok(result) => result,
            Err(err) => {
                self.h1.abort_dial(permit);
                return Err(err);
            }
        };

        match result.negotiated {
            NegotiatedProtocol::H2 => {
                // The socket becomes a multiplexed session; the H1 dial
                // slot frees up.
                self.h1.abort_dial(permit);
                let session = H2Session::establish(
                    result.socket,
                    key.binding,
                    self.config.max_concurrent_h2_streams,
                    self.config.drain_deadline,
                )
                .await?;
                let stream = session
                    .try_acquire_stream()
                    .ok_or(NetError::Http2ProtocolError)?;
                self.netlog.add_event_params(
                    NetLogEventType::SessionCreated,
                    serde_json::json!({"origin": key.origin.to_string(), "protocol": "h2"}),
                );
                self.mux.insert(key.clone(), MuxEntry::H2(session));
                Ok(HttpStream::H2(stream))
            }
            NegotiatedProtocol::Http1 => {
                let (sender, conn) =
                    hyper::client::conn::http1::handshake(TokioIo::new(result.socket))
                        .await
                        .map_err(|_| NetError::ConnectionFailed)?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(error = ?e, "HTTP/1.1 connection terminated");
                    }
                });
                let conn = self.h1.commit_dial(permit, sender);
                self.netlog.add_event_params(
                    NetLogEventType::SessionCreated,
                    serde_json::json!({"origin": key.origin.to_string(), "protocol": "http/1.1"}),
                );
                Ok(HttpStream::H1(conn))
            }
        }
    }

    async fn dial_quic(
        &self,
        key: &SessionKey,
        endpoints: &[SocketAddr],
        port: u16,
    ) -> Result<Arc<QuicSession>, NetError> {
        // Pins apply to QUIC origins too; certificate verification is
        // inside quiche (boringssl), SPKI extraction happens via the
        // configured verifier. A host with pins but no verified match is
        // rejected before body bytes are written at the request layer.
        let mut origin = key.origin.clone();
        origin.port = port;
        let params = QuicSessionParams {
            origin,
            endpoints: endpoints.to_vec(),
            binding: key.binding,
            alternate_network: *self.alternate_network.lock().unwrap(),
            quic: self.config.quic.clone(),
            migration: self.config.migration.clone(),
        };
        QuicSession::connect(
            params,
            Arc::clone(&self.server_info),
            &self.notifier,
            Arc::clone(&self.netlog),
        )
        .await
    }

    /// Opportunistic dial ahead of a request (stale-DNS pre-connection).
    /// The resulting connection is parked for the next `acquire_stream`.
    pub async fn preconnect(&self, key: &SessionKey, endpoints: &[SocketAddr]) {
        if self.mux.contains_key(key) || self.h1.has_idle(key) {
            return;
        }
        let Ok(permit) = self.h1.begin_dial(key, RequestPriority::Idle).await else {
            return;
        };
        let opts = ConnectOptions {
            connect_timeout: self.config.connect_timeout,
            enable_http2: self.config.enable_http2,
            binding: key.binding,
        };
        match ConnectJob::connect(&key.origin, endpoints, &self.pins, &opts).await {
            Ok(result) => match result.negotiated {
                NegotiatedProtocol::H2 => {
                    self.h1.abort_dial(permit);
                    if let Ok(session) = H2Session::establish(
                        result.socket,
                        key.binding,
                        self.config.max_concurrent_h2_streams,
                        self.config.drain_deadline,
                    )
                    .await
                    {
                        self.mux.insert(key.clone(), MuxEntry::H2(session));
                    }
                }
                NegotiatedProtocol::Http1 => {
                    match hyper::client::conn::http1::handshake(TokioIo::new(result.socket)).await
                    {
                        Ok((sender, conn)) => {
                            tokio::spawn(async move {
                                let _ = conn.await;
                            });
                            self.h1.abort_dial(permit);
                            self.h1.park_preconnected(key, sender);
                        }
                        Err(_) => self.h1.abort_dial(permit),
                    }
                }
            },
            Err(_) => self.h1.abort_dial(permit),
        }
    }

    /// Return an H1 connection after a transaction.
    pub fn release_h1(&self, conn: H1Connection, reusable: bool) {
        self.h1.release(conn, reusable);
    }

    /// Feed response status into the origin's circuit breaker.
    pub fn record_response_status(&self, key: &SessionKey, status: u16) {
        self.h1.record_response_status(key, status);
    }

    /// Remember an `alt-svc: h3=":port"` advertisement.
    pub fn note_alt_svc_h3(&self, origin: &Origin, port: u16) {
        self.alt_svc_h3.insert(origin.clone(), port);
    }

    fn quic_candidate_port(&self, origin: &Origin) -> Option<u16> {
        for hint in &self.config.quic_hints {
            if hint.host.eq_ignore_ascii_case(&origin.host) && hint.port == origin.port {
                return Some(if hint.alternate_port != 0 {
                    hint.alternate_port
                } else {
                    origin.port
                });
            }
        }
        self.alt_svc_h3.get(origin).map(|p| *p)
    }

    fn is_quic_broken(&self, origin: &Origin) -> bool {
        self.broken_quic
            .get(origin)
            .map(|b| Instant::now() < b.until)
            .unwrap_or(false)
    }

    fn mark_quic_broken(&self, origin: &Origin) {
        let mut entry = self.broken_quic.entry(origin.clone()).or_insert(BrokenQuic {
            until: Instant::now(),
            consecutive: 0,
        });
        let exp = if self.config.quic.broken_service_exponential_backoff {
            entry.consecutive.min(6)
        } else {
            0
        };
        let delay = self.config.quic.broken_service_initial_delay * (1u32 << exp);
        entry.until = Instant::now() + delay;
        entry.consecutive += 1;
    }

    /// The engine observed a non-default network (dis)appear.
    pub fn set_alternate_network(&self, network: Option<NetworkBinding>) {
        *self.alternate_network.lock().unwrap() = network;
    }

    /// Default-network change: idle H1 sockets on the old network are
    /// useless; QUIC sessions decide their own fate via the notifier.
    pub fn on_default_network_changed(&self) {
        self.h1.cleanup_idle();
    }

    /// Drain multiplexed sessions and drop pooled connections.
    pub async fn shutdown(&self) {
        let keys: Vec<SessionKey> = self.mux.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.mux.remove(&key) {
                match entry {
                    MuxEntry::H2(session) => session.shutdown_gracefully().await,
                    MuxEntry::H3(session) => session.close(),
                }
            }
        }
        self.h1.clear();
    }

    pub fn active_mux_sessions(&self) -> usize {
        self.mux.len()
    }
}
