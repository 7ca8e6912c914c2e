//! Session and stream lifecycle bookkeeping.
//!
//! Both multiplexed session kinds (HTTP/2 and QUIC) share this state
//! model. A session in `Draining` accepts no new streams; a stream
//! belongs to exactly one session until it reaches `Closed`.

use crate::base::network::NetworkBinding;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Transport session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    /// No new streams; in-flight streams finish.
    Draining,
    Closed,
}

/// Application-visible stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    HeadersSent,
    BodyStreaming,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Whether `next` is a legal successor state.
    pub fn can_advance_to(self, next: StreamState) -> bool {
        use StreamState::*;
        // Closed is reachable from anywhere (reset/cancel).
        if next == Closed {
            return true;
        }
        matches!(
            (self, next),
            (Idle, HeadersSent)
                | (HeadersSent, BodyStreaming)
                | (HeadersSent, HalfClosedLocal)
                | (HeadersSent, HalfClosedRemote)
                | (BodyStreaming, HalfClosedLocal)
                | (BodyStreaming, HalfClosedRemote)
                | (HalfClosedLocal, HalfClosedRemote)
                | (HalfClosedRemote, HalfClosedLocal)
        )
    }
}

/// Tracks a stream's state with transition validation.
#[derive(Debug)]
pub struct StreamStateMachine {
    state: Mutex<StreamState>,
}

impl Default for StreamStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StreamState::Idle),
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    /// Advance to `next`; returns false (leaving state untouched) on an
    /// illegal transition.
    pub fn advance(&self, next: StreamState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }
}

/// Shared bookkeeping for one transport session.
#[derive(Debug)]
pub struct SessionInfo {
    state: Mutex<SessionState>,
    binding: Mutex<NetworkBinding>,
    /// QUIC server-chosen connection id, when known.
    server_connection_id: Mutex<Option<Vec<u8>>>,
    active_streams: AtomicUsize,
    max_concurrent_streams: usize,
    pub alive_since: Instant,
    last_idle: Mutex<Instant>,
}

impl SessionInfo {
    pub fn new(binding: NetworkBinding, max_concurrent_streams: usize) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(SessionState::Connecting),
            binding: Mutex::new(binding),
            server_connection_id: Mutex::new(None),
            active_streams: AtomicUsize::new(0),
            max_concurrent_streams: max_concurrent_streams.max(1),
            alive_since: now,
            last_idle: Mutex::new(now),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Active -> Draining; a session already draining or closed is left
    /// alone. Returns true if the transition happened.
    pub fn mark_draining(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Active {
            *state = SessionState::Draining;
            true
        } else {
            false
        }
    }

    pub fn binding(&self) -> NetworkBinding {
        *self.binding.lock().unwrap()
    }

    /// Rebind after a QUIC migration; the logical session is preserved.
    pub fn set_binding(&self, binding: NetworkBinding) {
        *self.binding.lock().unwrap() = binding;
    }

    pub fn server_connection_id(&self) -> Option<Vec<u8>> {
        self.server_connection_id.lock().unwrap().clone()
    }

    pub fn set_server_connection_id(&self, id: Vec<u8>) {
        *self.server_connection_id.lock().unwrap() = Some(id);
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_streams(&self) -> usize {
        self.max_concurrent_streams
    }

    /// Seconds since the session last had zero active streams.
    pub fn idle_duration(&self) -> std::time::Duration {
        self.last_idle.lock().unwrap().elapsed()
    }

    pub fn is_idle(&self) -> bool {
        self.active_streams() == 0
    }

    /// Reserve a stream slot. Fails when the session refuses new streams
    /// (Draining/Closed) or is at the peer's concurrency limit.
    pub fn try_acquire_stream(self: &Arc<Self>) -> Option<StreamPermit> {
        if self.state() != SessionState::Active {
            return None;
        }
        let mut current = self.active_streams.load(Ordering::SeqCst);
        loop {
            if current >= self.max_concurrent_streams {
                return None;
            }
            match self.active_streams.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(StreamPermit {
                        info: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// RAII stream slot; releasing it updates the session's idle clock.
#[derive(Debug)]
pub struct StreamPermit {
    info: Arc<SessionInfo>,
}

impl StreamPermit {
    pub fn session(&self) -> &Arc<SessionInfo> {
        &self.info
    }
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        if self.info.active_streams.fetch_sub(1, Ordering::SeqCst) == 1 {
            *self.info.last_idle.lock().unwrap() = Instant::now();
        }
    }
}
