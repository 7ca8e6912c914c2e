//! HTTP/2 multiplexed session.
//!
//! Wraps a hyper http2 connection with the engine's session lifecycle:
//! stream accounting against the concurrency cap, GOAWAY handling
//! (drain, finish in-flight, refuse new), and graceful shutdown bounded
//! by a drain deadline.
//!
//! hyper has no GOAWAY callback, but once the frame arrives the
//! connection stops admitting new streams: `SendRequest::ready` and new
//! `send_request` calls fail with an h2 GOAWAY error while in-flight
//! streams keep running. A watcher task spawned at establishment polls
//! that readiness and flips the session to `Draining`; the stream send
//! path performs the same transition when it is first to observe the
//! frame.

use crate::base::neterror::NetError;
use crate::base::network::NetworkBinding;
use crate::pool::connect_job::ConnectedSocket;
use crate::pool::session::{SessionInfo, SessionState, StreamPermit, StreamState, StreamStateMachine};
use crate::pool::OutboundBody;
use hyper::body::Incoming;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::Arc;
use std::time::Duration;

/// Streams the engine is willing to multiplex on one connection.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 100;

/// Grace period for in-flight streams after draining begins.
pub const DEFAULT_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Cadence of the GOAWAY readiness probe.
const GOAWAY_PROBE_INTERVAL: Duration = Duration::from_millis(500);

pub struct H2Session {
    info: Arc<SessionInfo>,
    sender: http2::SendRequest<OutboundBody>,
    driver: tokio::task::AbortHandle,
    drain_deadline: Duration,
}

impl H2Session {
    /// Run the HTTP/2 preface over a connected socket.
    pub async fn establish(
        socket: ConnectedSocket,
        binding: NetworkBinding,
        max_concurrent_streams: usize,
        drain_deadline: Duration,
    ) -> Result<Arc<Self>, NetError> {
        let info = Arc::new(SessionInfo::new(binding, max_concurrent_streams));

        let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(socket))
            .await
            .map_err(map_hyper_error)?;

        let driver_info = Arc::clone(&info);
        let driver = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = ?e, "HTTP/2 connection terminated");
            }
            driver_info.set_state(SessionState::Closed);
        })
        .abort_handle();

        info.set_state(SessionState::Active);
        let session = Arc::new(Self {
            info,
            sender,
            driver,
            drain_deadline,
        });

        // GOAWAY watcher: readiness fails as soon as the peer refuses
        // new streams, well before the connection itself finishes.
        let weak = Arc::downgrade(&session);
        let mut probe = session.sender.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(GOAWAY_PROBE_INTERVAL).await;
                let Some(session) = weak.upgrade() else {
                    return;
                };
                if session.state() != SessionState::Active {
                    return;
                }
                if probe.ready().await.is_err() {
                    // In-flight streams finish; the driver task flips
                    // the state to Closed once the connection is gone.
                    session.start_draining();
                    return;
                }
            }
        });

        Ok(session)
    }

    pub fn info(&self) -> &Arc<SessionInfo> {
        &self.info
    }

    pub fn state(&self) -> SessionState {
        // The connection driver may have observed a close we haven't.
        if self.sender.is_closed() && self.info.state() == SessionState::Active {
            self.info.set_state(SessionState::Closed);
        }
        self.info.state()
    }

    /// Reserve a stream. `None` when draining, closed, or at the cap.
    pub fn try_acquire_stream(&self) -> Option<H2Stream> {
        if self.state() != SessionState::Active {
            return None;
        }
        let permit = self.info.try_acquire_stream()?;
        Some(H2Stream {
            sender: self.sender.clone(),
            permit,
            state: StreamStateMachine::new(),
        })
    }

    /// Peer GOAWAY or engine policy: stop accepting streams, let the
    /// in-flight ones finish.
    pub fn start_draining(&self) {
        if self.info.mark_draining() {
            tracing::debug!("HTTP/2 session draining");
        }
    }

    /// Drain and close, waiting for in-flight streams up to the drain
    /// deadline before tearing the connection down.
    pub async fn shutdown_gracefully(&self) {
        self.start_draining();
        let deadline = tokio::time::Instant::now() + self.drain_deadline;
        while self.info.active_streams() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.close();
    }

    /// Immediate teardown; in-flight streams fail.
    pub fn close(&self) {
        self.info.set_state(SessionState::Closed);
        self.driver.abort();
    }
}

/// One multiplexed request/response exchange.
pub struct H2Stream {
    sender: http2::SendRequest<OutboundBody>,
    permit: StreamPermit,
    state: StreamStateMachine,
}

impl H2Stream {
    pub async fn send_request(
        &mut self,
        req: http::Request<OutboundBody>,
    ) -> Result<http::Response<Incoming>, NetError> {
        if let Err(e) = self.sender.ready().await {
            return Err(self.classify(e));
        }
        self.state.advance(StreamState::HeadersSent);
        let response = match self.sender.send_request(req).await {
            Ok(response) => response,
            Err(e) => return Err(self.classify(e)),
        };
        self.state.advance(StreamState::HalfClosedLocal);
        Ok(response)
    }

    /// Map a hyper failure, draining the session when the failure is the
    /// first sight of a peer GOAWAY.
    fn classify(&self, err: hyper::Error) -> NetError {
        if hyper_error_is_goaway(&err) {
            if self.permit.session().mark_draining() {
                tracing::debug!("HTTP/2 session draining (GOAWAY)");
            }
            // The peer did not process this stream; safe to retry on a
            // fresh session.
            return NetError::ConnectionClosed;
        }
        map_hyper_error(err)
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

/// True when the failure is the h2 layer reporting a received GOAWAY.
fn hyper_error_is_goaway(err: &hyper::Error) -> bool {
    use std::error::Error as _;

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(h2_err) = cause.downcast_ref::<h2::Error>() {
            return h2_err.is_go_away() && h2_err.is_remote();
        }
        source = cause.source();
    }
    false
}

/// Translate hyper/h2 failures into the engine taxonomy. REFUSED_STREAM
/// stays distinguishable so the request layer can retry transparently.
fn map_hyper_error(err: hyper::Error) -> NetError {
    use std::error::Error as _;

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(h2_err) = cause.downcast_ref::<h2::Error>() {
            return match h2_err.reason() {
                Some(h2::Reason::REFUSED_STREAM) => NetError::Http2ServerRefusedStream,
                Some(h2::Reason::CANCEL) => NetError::Http2StreamClosed,
                Some(h2::Reason::FLOW_CONTROL_ERROR) | Some(h2::Reason::PROTOCOL_ERROR) => {
                    NetError::Http2ProtocolError
                }
                Some(_) => NetError::Http2ProtocolError,
                None if h2_err.is_io() => NetError::ConnectionReset,
                None => NetError::Http2ProtocolError,
            };
        }
        source = cause.source();
    }

    if err.is_canceled() {
        NetError::Http2StreamClosed
    } else if err.is_incomplete_message() {
        NetError::ConnectionClosed
    } else if err.is_timeout() {
        NetError::TimedOut
    } else {
        NetError::ConnectionFailed
    }
}
