//! QUIC/HTTP3 session.
//!
//! One driver task owns the quiche connection, its UDP sockets, and all
//! timers; request handles talk to it over a command channel. Migration
//! decisions come from the `MigrationController`; this module only
//! executes the resulting actions (path probes, socket swaps, drains).
//!
//! Streams see contiguous bytes across path switches: quiche reassembles
//! per-stream data irrespective of which validated path carried it, so
//! migration stays invisible above the stream API.

use crate::base::netlog::{NetLog, NetLogEventType};
use crate::base::neterror::NetError;
use crate::base::network::{NetworkBinding, NetworkChangeEvent, NetworkChangeNotifier};
use crate::dns::Origin;
use crate::pool::session::{SessionInfo, SessionState, StreamPermit, StreamState, StreamStateMachine};
use crate::quic::config::QuicConfig;
use crate::quic::migration::{
    MigrationAction, MigrationConfig, MigrationController, MigrationState,
};
use crate::quic::server_info::QuicServerInfoStore;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};

/// Packets from the abandoned path are still read for this long after a
/// migration (anti-amplification grace).
const OLD_PATH_ACCEPT_WINDOW: Duration = Duration::from_secs(2);

/// Cadence of the path-quality check feeding degradation detection.
const PATH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// RTT above which a path counts as degrading.
const DEGRADING_RTT: Duration = Duration::from_millis(500);

/// Newly lost packets per check interval that count as degrading.
const DEGRADING_LOSS_DELTA: u64 = 10;

const MAX_DATAGRAM_SIZE: usize = 1350;

/// Request head sent on an H3 stream.
#[derive(Debug, Clone)]
pub struct H3RequestParts {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Response head received from the peer.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

/// Body chunks for one stream, in network order.
pub struct H3Body {
    rx: mpsc::UnboundedReceiver<Result<Bytes, NetError>>,
}

impl H3Body {
    pub async fn data(&mut self) -> Option<Result<Bytes, NetError>> {
        self.rx.recv().await
    }
}

enum SessionCommand {
    Request {
        parts: H3RequestParts,
        resp_tx: oneshot::Sender<Result<ResponseHead, NetError>>,
        body_tx: mpsc::UnboundedSender<Result<Bytes, NetError>>,
    },
    Drain,
    Close,
}

/// Connection parameters for one QUIC session.
pub struct QuicSessionParams {
    pub origin: Origin,
    pub endpoints: Vec<SocketAddr>,
    pub binding: NetworkBinding,
    pub alternate_network: Option<NetworkBinding>,
    pub quic: QuicConfig,
    pub migration: MigrationConfig,
}

/// Handle to a live QUIC session.
pub struct QuicSession {
    info: Arc<SessionInfo>,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    host: String,
}

impl QuicSession {
    /// Dial and complete the handshake. Retries once on the alternate
    /// network for pre-handshake failures when the policy allows it.
    pub async fn connect(
        params: QuicSessionParams,
        server_info: Arc<QuicServerInfoStore>,
        notifier: &NetworkChangeNotifier,
        netlog: Arc<NetLog>,
    ) -> Result<Arc<Self>, NetError> {
        let retry_binding = if params.migration.retry_pre_handshake_errors_on_non_default_network {
            params.alternate_network.filter(|n| *n != params.binding)
        } else {
            None
        };

        match Self::connect_once(&params, params.binding, Arc::clone(&server_info), notifier, Arc::clone(&netlog)).await {
            Ok(session) => Ok(session),
            Err(err) if err == NetError::QuicHandshakeFailed => {
                let Some(alternate) = retry_binding else {
                    return Err(err);
                };
                tracing::debug!(origin = %params.origin, "retrying QUIC handshake on alternate network");
                Self::connect_once(&params, alternate, server_info, notifier, netlog).await
            }
            Err(err) => Err(err),
        }
    }

    async fn connect_once(
        params: &QuicSessionParams,
        binding: NetworkBinding,
        server_info: Arc<QuicServerInfoStore>,
        notifier: &NetworkChangeNotifier,
        netlog: Arc<NetLog>,
    ) -> Result<Arc<Self>, NetError> {
        let peer = params
            .endpoints
            .first()
            .map(|addr| SocketAddr::new(addr.ip(), params.origin.port))
            .ok_or(NetError::NameNotResolved)?;

        let bind_addr: SocketAddr = if peer.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|_| NetError::QuicHandshakeFailed)?;
        let local = socket.local_addr().map_err(|_| NetError::QuicHandshakeFailed)?;

        let mut config = params.quic.to_quiche()?;

        let mut scid_bytes = [0u8; quiche::MAX_CONN_ID_LEN];
        boring::rand::rand_bytes(&mut scid_bytes).map_err(|_| NetError::Unexpected)?;
        let scid = quiche::ConnectionId::from_ref(&scid_bytes);

        let mut conn = quiche::connect(Some(&params.origin.host), &scid, local, peer, &mut config)
            .map_err(|_| NetError::QuicHandshakeFailed)?;

        // 0-RTT resumption from a stored server config.
        if params.quic.enable_0rtt {
            if let Some(blob) = server_info.get(&params.origin.host) {
                if conn.set_session(&blob).is_err() {
                    server_info.remove(&params.origin.host);
                }
            }
        }

        let info = Arc::new(SessionInfo::new(
            binding,
            params.quic.initial_max_streams_bidi as usize,
        ));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, mut ready_rx) = watch::channel(None::<Result<(), NetError>>);

        let mut controller = MigrationController::new(params.migration.clone(), binding);
        controller.set_alternate_network(params.alternate_network);

        let driver = Driver {
            origin: params.origin.clone(),
            conn,
            h3: None,
            socket: Arc::new(socket),
            local,
            peer,
            old_socket: None,
            probe: None,
            peer_probe: None,
            controller,
            info: Arc::clone(&info),
            server_info,
            netlog,
            net_rx: notifier.subscribe(),
            cmd_rx,
            ready_tx,
            streams: HashMap::new(),
            queued: Vec::new(),
            non_default_deadline: None,
            pending_action: None,
            max_time_on_non_default: params.migration.max_time_on_non_default_network,
            last_lost: 0,
            default_network_known: notifier.default_network(),
        };
        tokio::spawn(driver.run());

        // Wait for the handshake, bounded by the crypto timeout.
        let deadline = tokio::time::sleep(params.quic.crypto_handshake_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                changed = ready_rx.changed() => {
                    if changed.is_err() {
                        return Err(NetError::QuicHandshakeFailed);
                    }
                    let state = ready_rx.borrow().clone();
                    match state {
                        Some(Ok(())) => break,
                        Some(Err(err)) => return Err(err),
                        None => continue,
                    }
                }
                _ = &mut deadline => {
                    let _ = cmd_tx.send(SessionCommand::Close);
                    return Err(NetError::ConnectionTimedOut);
                }
            }
        }

        Ok(Arc::new(Self {
            info,
            cmd_tx,
            host: params.origin.host.clone(),
        }))
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> SessionState {
        self.info.state()
    }

    /// Reserve a stream slot. `None` when draining/closed or at the
    /// peer's concurrency limit.
    pub fn try_acquire_stream(&self) -> Option<H3Stream> {
        let permit = self.info.try_acquire_stream()?;
        Some(H3Stream {
            cmd_tx: self.cmd_tx.clone(),
            permit,
            state: StreamStateMachine::new(),
        })
    }

    /// Stop accepting streams; in-flight ones finish.
    pub fn start_draining(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Drain);
    }

    /// Tear the session down; in-flight streams fail.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Close);
    }
}

/// One request/response exchange over the session.
pub struct H3Stream {
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    permit: StreamPermit,
    state: StreamStateMachine,
}

impl H3Stream {
    pub async fn send_request(
        &mut self,
        parts: H3RequestParts,
    ) -> Result<(ResponseHead, H3Body), NetError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        self.cmd_tx
            .send(SessionCommand::Request {
                parts,
                resp_tx,
                body_tx,
            })
            .map_err(|_| NetError::QuicProtocolError)?;
        self.state.advance(StreamState::HeadersSent);

        let head = resp_rx.await.map_err(|_| NetError::QuicProtocolError)??;
        self.state.advance(StreamState::HalfClosedLocal);
        Ok((head, H3Body { rx: body_rx }))
    }

    pub fn stream_state(&self) -> StreamState {
        self.state.state()
    }

    pub fn mark_body_complete(&self) {
        self.state.advance(StreamState::Closed);
    }

    pub fn session(&self) -> &Arc<SessionInfo> {
        self.permit.session()
    }
}

struct StreamSink {
    resp_tx: Option<oneshot::Sender<Result<ResponseHead, NetError>>>,
    body_tx: mpsc::UnboundedSender<Result<Bytes, NetError>>,
    pending_body: Option<(Bytes, usize)>,
}

struct PendingRequest {
    parts: H3RequestParts,
    resp_tx: oneshot::Sender<Result<ResponseHead, NetError>>,
    body_tx: mpsc::UnboundedSender<Result<Bytes, NetError>>,
}

/// Probe toward a new local path.
struct PathProbe {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    network: NetworkBinding,
    /// Port-only migration keeps the controller out of the loop.
    port_only: bool,
}

struct Driver {
    origin: Origin,
    conn: quiche::Connection,
    h3: Option<quiche::h3::Connection>,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
    /// Abandoned path kept readable until the grace window closes.
    old_socket: Option<(Arc<UdpSocket>, tokio::time::Instant)>,
    probe: Option<PathProbe>,
    /// Server-directed migration target under validation.
    peer_probe: Option<SocketAddr>,
    controller: MigrationController,
    info: Arc<SessionInfo>,
    server_info: Arc<QuicServerInfoStore>,
    netlog: Arc<NetLog>,
    net_rx: tokio::sync::broadcast::Receiver<NetworkChangeEvent>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ready_tx: watch::Sender<Option<Result<(), NetError>>>,
    streams: HashMap<u64, StreamSink>,
    /// Requests held back while connecting or migrating.
    queued: Vec<PendingRequest>,
    non_default_deadline: Option<tokio::time::Instant>,
    /// Action produced at a sync trigger site, executed on the next
    /// loop turn.
    pending_action: Option<MigrationAction>,
    max_time_on_non_default: Duration,
    last_lost: u64,
    default_network_known: NetworkBinding,
}

impl Driver {
    async fn run(mut self) {
        let mut buf = [0u8; 65535];
        let mut probe_buf = [0u8; 65535];
        let mut old_buf = [0u8; 65535];
        let mut path_check = tokio::time::interval(PATH_CHECK_INTERVAL);

        loop {
            self.flush_egress().await;

            if self.conn.is_closed() {
                self.fail_all(NetError::ConnectionClosed);
                self.info.set_state(SessionState::Closed);
                let _ = self.ready_tx.send(Some(Err(NetError::QuicHandshakeFailed)));
                return;
            }

            self.expire_old_path();

            let timeout = self
                .conn
                .timeout()
                .unwrap_or(Duration::from_secs(60));

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Request { parts, resp_tx, body_tx }) => {
                            self.queued.push(PendingRequest { parts, resp_tx, body_tx });
                        }
                        Some(SessionCommand::Drain) => {
                            self.controller.mark_draining();
                            self.info.set_state(SessionState::Draining);
                        }
                        Some(SessionCommand::Close) | None => {
                            let _ = self.conn.close(false, 0x100, b"close");
                            self.fail_all(NetError::ConnectionAborted);
                            self.info.set_state(SessionState::Closed);
                            return;
                        }
                    }
                }
                recv = self.socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, from)) => {
                            let info = quiche::RecvInfo { to: self.local, from };
                            if let Err(e) = self.conn.recv(&mut buf[..len], info) {
                                if e != quiche::Error::Done {
                                    tracing::debug!(error = ?e, "quiche recv failed");
                                }
                            }
                        }
                        Err(_) => {
                            self.on_write_error();
                        }
                    }
                }
                recv = Self::recv_optional(self.probe.as_ref().map(|p| (Arc::clone(&p.socket), p.local)), &mut probe_buf) => {
                    if let Some((len, from, to)) = recv {
                        let info = quiche::RecvInfo { to, from };
                        let _ = self.conn.recv(&mut probe_buf[..len], info);
                    }
                }
                recv = Self::recv_optional(self.old_socket.as_ref().map(|(s, _)| (Arc::clone(s), self.local)), &mut old_buf) => {
                    // Late packets from the abandoned path are still fed
                    // to the connection inside the grace window.
                    if let Some((len, from, to)) = recv {
                        let info = quiche::RecvInfo { to, from };
                        let _ = self.conn.recv(&mut old_buf[..len], info);
                    }
                }
                event = self.net_rx.recv() => {
                    if let Ok(event) = event {
                        self.on_network_event(event).await;
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    self.conn.on_timeout();
                }
                _ = path_check.tick() => {
                    self.check_path_quality();
                }
                _ = Self::sleep_until_opt(self.non_default_deadline) => {
                    self.on_non_default_timer().await;
                }
            }

            self.after_io().await;
        }
    }

    /// Receive from an optional secondary socket; pends forever when absent.
    async fn recv_optional(
        socket: Option<(Arc<UdpSocket>, SocketAddr)>,
        buf: &mut [u8],
    ) -> Option<(usize, SocketAddr, SocketAddr)> {
        match socket {
            Some((socket, to)) => match socket.recv_from(buf).await {
                Ok((len, from)) => Some((len, from, to)),
                Err(_) => None,
            },
            None => std::future::pending().await,
        }
    }

    async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    async fn after_io(&mut self) {
        // Handshake completion: bring up H3 and release queued requests.
        if self.h3.is_none() && self.conn.is_established() {
            match quiche::h3::Config::new()
                .and_then(|h3_config| quiche::h3::Connection::with_transport(&mut self.conn, &h3_config))
            {
                Ok(h3) => {
                    self.h3 = Some(h3);
                    self.info.set_state(SessionState::Active);
                    self.info
                        .set_server_connection_id(self.conn.destination_id().to_vec());
                    if let Some(session) = self.conn.session() {
                        self.server_info.put(&self.origin.host, session.to_vec());
                    }
                    let _ = self.ready_tx.send(Some(Ok(())));
                    self.netlog.add_event_params(
                        NetLogEventType::SessionCreated,
                        serde_json::json!({"origin": self.origin.to_string(), "protocol": "h3"}),
                    );
                }
                Err(e) => {
                    tracing::debug!(error = ?e, "h3 bring-up failed");
                    let _ = self.conn.close(false, 0x101, b"h3 setup");
                    let _ = self.ready_tx.send(Some(Err(NetError::QuicProtocolError)));
                }
            }
        }

        if let Some(action) = self.pending_action.take() {
            self.execute(action).await;
        }
        self.process_path_events();
        self.submit_queued();
        self.flush_pending_bodies();
        self.process_h3_events();
        self.flush_egress().await;
    }

    /// Writes queue while a path probe is deciding; otherwise submit.
    fn submit_queued(&mut self) {
        if self.h3.is_none() || self.controller.writes_queued() {
            return;
        }
        if self.info.state() != SessionState::Active {
            for req in self.queued.drain(..) {
                let _ = req.resp_tx.send(Err(NetError::ConnectionClosed));
            }
            return;
        }
        let queued: Vec<PendingRequest> = self.queued.drain(..).collect();
        for req in queued {
            self.submit_request(req);
        }
    }

    fn submit_request(&mut self, req: PendingRequest) {
        let Some(h3) = self.h3.as_mut() else {
            self.queued.push(req);
            return;
        };

        let mut headers = vec![
            quiche::h3::Header::new(b":method", req.parts.method.as_bytes()),
            quiche::h3::Header::new(b":scheme", req.parts.scheme.as_bytes()),
            quiche::h3::Header::new(b":authority", req.parts.authority.as_bytes()),
            quiche::h3::Header::new(b":path", req.parts.path.as_bytes()),
        ];
        for (name, value) in &req.parts.headers {
            headers.push(quiche::h3::Header::new(name.as_bytes(), value.as_bytes()));
        }

        let has_body = !req.parts.body.is_empty();
        match h3.send_request(&mut self.conn, &headers, !has_body) {
            Ok(stream_id) => {
                let mut sink = StreamSink {
                    resp_tx: Some(req.resp_tx),
                    body_tx: req.body_tx,
                    pending_body: None,
                };
                if has_body {
                    sink.pending_body = Some((req.parts.body.clone(), 0));
                }
                self.streams.insert(stream_id, sink);
            }
            Err(quiche::h3::Error::StreamBlocked) | Err(quiche::h3::Error::TransportError(quiche::Error::Done)) => {
                self.queued.push(req);
            }
            Err(e) => {
                tracing::debug!(error = ?e, "h3 send_request failed");
                let _ = req.resp_tx.send(Err(NetError::QuicProtocolError));
            }
        }
    }

    fn flush_pending_bodies(&mut self) {
        let Some(h3) = self.h3.as_mut() else { return };
        for (stream_id, sink) in self.streams.iter_mut() {
            if let Some((body, offset)) = sink.pending_body.take() {
                match h3.send_body(&mut self.conn, *stream_id, &body[offset..], true) {
                    Ok(written) if offset + written < body.len() => {
                        sink.pending_body = Some((body, offset + written));
                    }
                    Ok(_) => {}
                    Err(quiche::h3::Error::Done) => {
                        sink.pending_body = Some((body, offset));
                    }
                    Err(e) => {
                        tracing::debug!(error = ?e, "h3 send_body failed");
                        let _ = sink.body_tx.send(Err(NetError::QuicProtocolError));
                    }
                }
            }
        }
    }

    fn process_h3_events(&mut self) {
        let Some(h3) = self.h3.as_mut() else { return };
        let mut fatal = false;
        loop {
            match h3.poll(&mut self.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, .. })) => {
                    let mut status = 0u16;
                    let mut headers = Vec::with_capacity(list.len());
                    for header in &list {
                        let name = String::from_utf8_lossy(quiche::h3::NameValue::name(header)).into_owned();
                        let value = String::from_utf8_lossy(quiche::h3::NameValue::value(header)).into_owned();
                        if name == ":status" {
                            status = value.parse().unwrap_or(0);
                        } else if !name.starts_with(':') {
                            headers.push((name, value));
                        }
                    }
                    if let Some(sink) = self.streams.get_mut(&stream_id) {
                        if let Some(tx) = sink.resp_tx.take() {
                            let _ = tx.send(Ok(ResponseHead { status, headers }));
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Data)) => {
                    let mut chunk = vec![0u8; 16 * 1024];
                    while let Ok(read) = h3.recv_body(&mut self.conn, stream_id, &mut chunk) {
                        if let Some(sink) = self.streams.get_mut(&stream_id) {
                            let _ = sink
                                .body_tx
                                .send(Ok(Bytes::copy_from_slice(&chunk[..read])));
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Finished)) => {
                    // Dropping the sink closes the body channel; the
                    // reader sees end-of-stream.
                    self.streams.remove(&stream_id);
                }
                Ok((stream_id, quiche::h3::Event::Reset(code))) => {
                    if let Some(sink) = self.streams.remove(&stream_id) {
                        tracing::debug!(stream_id, code, "h3 stream reset");
                        if let Some(tx) = sink.resp_tx {
                            let _ = tx.send(Err(NetError::QuicProtocolError));
                        } else {
                            let _ = sink.body_tx.send(Err(NetError::QuicProtocolError));
                        }
                    }
                }
                Ok((_, quiche::h3::Event::GoAway)) => {
                    self.controller.mark_draining();
                    self.info.set_state(SessionState::Draining);
                    self.netlog.add_event_params(
                        NetLogEventType::SessionDraining,
                        serde_json::json!({"origin": self.origin.to_string(), "reason": "goaway"}),
                    );
                }
                Ok(_) => {}
                Err(quiche::h3::Error::Done) => break,
                Err(e) => {
                    tracing::debug!(error = ?e, "h3 poll failed");
                    fatal = true;
                    break;
                }
            }
        }
        if fatal {
            self.fail_all(NetError::QuicProtocolError);
            let _ = self.conn.close(false, 0x101, b"h3");
        }
    }

    async fn on_network_event(&mut self, event: NetworkChangeEvent) {
        match event {
            NetworkChangeEvent::DefaultNetworkChanged(binding) => {
                self.default_network_known = binding;
                let action = self.controller.on_default_network_changed(
                    binding,
                    self.info.is_idle(),
                    self.info.idle_duration(),
                );
                self.netlog.add_event_params(
                    NetLogEventType::QuicMigrationTriggered,
                    serde_json::json!({"origin": self.origin.to_string(), "trigger": "default_network_changed"}),
                );
                self.execute(action).await;
            }
            NetworkChangeEvent::NetworkConnected(binding) => {
                self.controller.set_alternate_network(Some(binding));
            }
            NetworkChangeEvent::NetworkDisconnected(binding) => {
                let action = self.controller.on_network_disconnected(binding);
                self.execute(action).await;
            }
            NetworkChangeEvent::IpAddressChanged => {
                // Same policy as a default-network change to the same
                // binding: close or goaway when configured.
                let action = self.controller.on_default_network_changed(
                    self.default_network_known,
                    self.info.is_idle(),
                    self.info.idle_duration(),
                );
                self.execute(action).await;
            }
        }
    }

    fn check_path_quality(&mut self) {
        if !self.conn.is_established() {
            return;
        }
        let stats = self.conn.stats();
        let lost_delta = stats.lost as u64 - self.last_lost;
        self.last_lost = stats.lost as u64;
        let rtt = self.conn.path_stats().next().map(|p| p.rtt);

        let degrading =
            lost_delta >= DEGRADING_LOSS_DELTA || rtt.map(|r| r > DEGRADING_RTT).unwrap_or(false);
        if degrading {
            let action = self.controller.on_path_degrading();
            if action != MigrationAction::None {
                self.netlog.add_event_params(
                    NetLogEventType::QuicMigrationTriggered,
                    serde_json::json!({"origin": self.origin.to_string(), "trigger": "path_degrading"}),
                );
                // Executed on the next loop turn; probes bind sockets.
                self.pending_action = Some(action);
            }
        }
    }

    fn on_write_error(&mut self) {
        let action = self.controller.on_write_error();
        if action != MigrationAction::None {
            self.pending_action = Some(action);
        }
    }

    async fn on_non_default_timer(&mut self) {
        self.non_default_deadline = None;
        // Whether the default path recovered is only learnable by
        // probing it; a bound default is worth the attempt.
        let default_healthy = self.default_network_known.is_bound();
        let action = self.controller.on_non_default_timer(default_healthy);
        self.execute(action).await;
    }

    /// Execute a migration action. Separated sync/async because probe
    /// setup binds sockets.
    async fn execute(&mut self, action: MigrationAction) {
        match action {
            MigrationAction::ProbePath { network } => {
                self.start_probe(network, false).await;
            }
            MigrationAction::ProbePort => {
                let network = self.controller.current_network();
                self.start_probe(network, true).await;
            }
            MigrationAction::MigrateToServerAddress(addr) => {
                self.peer_probe = Some(addr);
                if self.conn.probe_path(self.local, addr).is_err() {
                    self.peer_probe = None;
                }
            }
            other => {
                let _ = self.execute_sync(other);
            }
        }
    }

    /// Socket-free actions.
    fn execute_sync(&mut self, action: MigrationAction) -> Option<()> {
        match action {
            MigrationAction::None => {}
            MigrationAction::CloseSession => {
                let _ = self.conn.close(false, 0x100, b"network changed");
                self.fail_all(NetError::NetworkChanged);
                self.info.set_state(SessionState::Closed);
            }
            MigrationAction::StartDraining => {
                self.info.set_state(SessionState::Draining);
            }
            MigrationAction::ExtendNonDefaultTimer => {
                self.arm_non_default_timer();
            }
            MigrationAction::MigrateTo { network, arm_non_default_timer } => {
                // The probe socket becomes the session's path.
                if let Some(probe) = self.probe.take() {
                    if self.conn.migrate(probe.local, self.peer).is_ok() {
                        self.swap_socket(probe.socket, probe.local);
                        self.info.set_binding(network);
                        self.netlog.add_event_params(
                            NetLogEventType::QuicMigrationCompleted,
                            serde_json::json!({"origin": self.origin.to_string()}),
                        );
                    }
                }
                if arm_non_default_timer {
                    self.arm_non_default_timer();
                } else {
                    self.non_default_deadline = None;
                }
            }
            MigrationAction::ProbePath { .. }
            | MigrationAction::ProbePort
            | MigrationAction::MigrateToServerAddress(_) => {
                // Async variants handled by `execute`.
                return Some(());
            }
        }
        None
    }

    async fn start_probe(&mut self, network: NetworkBinding, port_only: bool) {
        let bind_addr: SocketAddr = if self.peer.is_ipv6() {
            "[::]:0".parse().unwrap()
        } else {
            "0.0.0.0:0".parse().unwrap()
        };
        let Ok(socket) = UdpSocket::bind(bind_addr).await else {
            self.finish_probe(network, port_only, false);
            return;
        };
        let Ok(local) = socket.local_addr() else {
            self.finish_probe(network, port_only, false);
            return;
        };

        // A probe needs a spare connection-id pair.
        if self.conn.scids_left() > 0 {
            let mut cid_bytes = [0u8; quiche::MAX_CONN_ID_LEN];
            if boring::rand::rand_bytes(&mut cid_bytes).is_ok() {
                let cid = quiche::ConnectionId::from_ref(&cid_bytes);
                let mut token = [0u8; 16];
                let _ = boring::rand::rand_bytes(&mut token);
                let _ = self.conn.new_scid(&cid, u128::from_be_bytes(token), false);
            }
        }

        self.netlog.add_event_params(
            NetLogEventType::QuicPathProbe,
            serde_json::json!({"origin": self.origin.to_string(), "port_only": port_only}),
        );

        match self.conn.probe_path(local, self.peer) {
            Ok(_) => {
                self.probe = Some(PathProbe {
                    socket: Arc::new(socket),
                    local,
                    network,
                    port_only,
                });
            }
            Err(e) => {
                tracing::debug!(error = ?e, "probe_path failed");
                self.finish_probe(network, port_only, false);
            }
        }
    }

    /// Handle quiche path events, mapping validation outcomes back into
    /// the controller.
    fn process_path_events(&mut self) {
        while let Some(event) = self.conn.path_event_next() {
            match event {
                quiche::PathEvent::Validated(local, peer) => {
                    if self.peer_probe == Some(peer) {
                        // Server-directed migration target validated.
                        if self.conn.migrate(self.local, peer).is_ok() {
                            self.peer = peer;
                        }
                        self.peer_probe = None;
                        continue;
                    }
                    if let Some(probe) = &self.probe {
                        if probe.local == local {
                            let (network, port_only) = (probe.network, probe.port_only);
                            self.finish_probe(network, port_only, true);
                        }
                    }
                }
                quiche::PathEvent::FailedValidation(local, _) => {
                    if self.peer_probe.is_some() {
                        self.peer_probe = None;
                        continue;
                    }
                    if let Some(probe) = &self.probe {
                        if probe.local == local {
                            let (network, port_only) = (probe.network, probe.port_only);
                            self.probe = None;
                            self.finish_probe(network, port_only, false);
                        }
                    }
                }
                quiche::PathEvent::Closed(..)
                | quiche::PathEvent::New(..)
                | quiche::PathEvent::ReusedSourceConnectionId(..)
                | quiche::PathEvent::PeerMigrated(..) => {}
            }
        }
    }

    fn finish_probe(&mut self, network: NetworkBinding, port_only: bool, success: bool) {
        if port_only {
            // Port migration never involves the controller: on success
            // the validated path simply replaces the current one.
            if success {
                if let Some(probe) = self.probe.take() {
                    if self.conn.migrate(probe.local, self.peer).is_ok() {
                        self.swap_socket(probe.socket, probe.local);
                    }
                }
            } else {
                self.probe = None;
            }
            return;
        }

        let action = self.controller.on_probe_result(network, success);
        if !success {
            self.probe = None;
            // A failed return probe leaves us on the non-default
            // network; keep trying on the timer cadence.
            if self.controller.state() == MigrationState::OnNonDefault {
                self.arm_non_default_timer();
            }
        }
        let _ = self.execute_sync(action);
    }

    fn swap_socket(&mut self, socket: Arc<UdpSocket>, local: SocketAddr) {
        let old = std::mem::replace(&mut self.socket, socket);
        self.old_socket = Some((
            old,
            tokio::time::Instant::now() + OLD_PATH_ACCEPT_WINDOW,
        ));
        self.local = local;
    }

    fn expire_old_path(&mut self) {
        if let Some((_, expiry)) = &self.old_socket {
            if tokio::time::Instant::now() >= *expiry {
                self.old_socket = None;
            }
        }
    }

    fn arm_non_default_timer(&mut self) {
        self.non_default_deadline =
            Some(tokio::time::Instant::now() + self.max_time_on_non_default);
    }

    async fn flush_egress(&mut self) {
        let mut out = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            match self.conn.send(&mut out) {
                Ok((write, send_info)) => {
                    let socket = if let Some(probe) = &self.probe {
                        if send_info.from == probe.local {
                            Arc::clone(&probe.socket)
                        } else {
                            Arc::clone(&self.socket)
                        }
                    } else {
                        Arc::clone(&self.socket)
                    };
                    if let Err(e) = socket.send_to(&out[..write], send_info.to).await {
                        tracing::debug!(error = %e, "UDP send failed");
                        self.on_write_error();
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    tracing::debug!(error = ?e, "quiche send failed");
                    let _ = self.conn.close(false, 0x1, b"send");
                    break;
                }
            }
        }
    }

    fn fail_all(&mut self, error: NetError) {
        for (_, sink) in self.streams.drain() {
            if let Some(tx) = sink.resp_tx {
                let _ = tx.send(Err(error.clone()));
            } else {
                let _ = sink.body_tx.send(Err(error.clone()));
            }
        }
        for req in self.queued.drain(..) {
            let _ = req.resp_tx.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parts_shape() {
        let parts = H3RequestParts {
            method: "GET".into(),
            scheme: "https".into(),
            authority: "example.com".into(),
            path: "/echo".into(),
            headers: vec![("accept".into(), "*/*".into())],
            body: Bytes::new(),
        };
        assert!(parts.body.is_empty());
        assert_eq!(parts.method, "GET");
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let params = QuicSessionParams {
            origin: Origin::new("https", "example.com", 443),
            endpoints: Vec::new(),
            binding: NetworkBinding::UNBOUND,
            alternate_network: None,
            quic: QuicConfig::default(),
            migration: MigrationConfig::default(),
        };
        let notifier = NetworkChangeNotifier::new();
        let err = QuicSession::connect(
            params,
            Arc::new(QuicServerInfoStore::new(4, None)),
            &notifier,
            Arc::new(NetLog::new()),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err, NetError::NameNotResolved);
    }
}
