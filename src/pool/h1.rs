//! HTTP/1.1 connection pool.
//!
//! Per-origin groups of parked keep-alive connections with Chromium-like
//! limits (6 per group, 256 total). Pipelining is disabled: a connection
//! serves one transaction at a time and is re-parked afterwards. A
//! circuit breaker per group backs off new dials after a burst of 5xx.

use super::{OutboundBody, RequestPriority, SessionKey};
use crate::base::neterror::NetError;
use dashmap::DashMap;
use hyper::client::conn::http1;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Used sockets park for 5 minutes, never-used ones for 10 seconds.
const USED_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const UNUSED_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct H1PoolConfig {
    pub max_per_group: usize,
    pub max_total: usize,
    pub breaker: BreakerConfig,
}

impl Default for H1PoolConfig {
    fn default() -> Self {
        Self {
            max_per_group: 6,
            max_total: 256,
            breaker: BreakerConfig::default(),
        }
    }
}

/// 5xx-burst circuit breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive 5xx responses that trip the breaker.
    pub threshold: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitBreaker {
    consecutive_5xx: u32,
    open_until: Option<Instant>,
    trips: u32,
}

impl CircuitBreaker {
    fn is_open(&self) -> bool {
        matches!(self.open_until, Some(until) if Instant::now() < until)
    }

    fn record_status(&mut self, status: u16, config: &BreakerConfig) {
        if (500..600).contains(&status) {
            self.consecutive_5xx += 1;
            if self.consecutive_5xx >= config.threshold {
                // Exponential window, doubling per trip.
                let exp = self.trips.min(10);
                let delay = config
                    .base_delay
                    .saturating_mul(1u32 << exp)
                    .min(config.max_delay);
                self.open_until = Some(Instant::now() + delay);
                self.trips += 1;
                self.consecutive_5xx = 0;
                tracing::debug!(delay_ms = delay.as_millis() as u64, "H1 circuit breaker opened");
            }
        } else {
            self.consecutive_5xx = 0;
            if !self.is_open() {
                self.trips = 0;
            }
        }
    }
}

/// An HTTP/1.1 transaction slot: exclusive use of one parked or fresh
/// connection. The embedded guard returns the slot to the pool when the
/// connection is dropped without an explicit release (cancellation).
pub struct H1Connection {
    pub sender: http1::SendRequest<OutboundBody>,
    pub reused: bool,
    guard: SlotGuard,
}

/// RAII hold on one active-connection slot of a group.
struct SlotGuard {
    pool: Arc<H1Pool>,
    key: SessionKey,
    armed: bool,
}

impl SlotGuard {
    fn disarm(mut self) -> SessionKey {
        self.armed = false;
        self.key.clone()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot(&self.key);
        }
    }
}

struct IdleConn {
    sender: http1::SendRequest<OutboundBody>,
    parked_at: Instant,
    was_used: bool,
}

struct PendingWaiter {
    priority: RequestPriority,
    created_at: Instant,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Group {
    idle: VecDeque<IdleConn>,
    active_count: usize,
    pending: Vec<PendingWaiter>,
    breaker: CircuitBreaker,
}

impl Group {
    fn total_slots(&self) -> usize {
        self.active_count + self.idle.len()
    }

    fn pop_highest_priority_waiter(&mut self) -> Option<PendingWaiter> {
        if self.pending.is_empty() {
            return None;
        }
        let max_idx = self
            .pending
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.created_at.cmp(&a.created_at)) // older first
            })
            .map(|(i, _)| i)?;
        Some(self.pending.swap_remove(max_idx))
    }
}

/// Permission to dial one new connection for a group. Dropping it
/// without committing frees the slot.
pub struct DialPermit {
    guard: SlotGuard,
}

/// Pool of HTTP/1.1 connections shared by an engine.
pub struct H1Pool {
    groups: DashMap<SessionKey, Group>,
    total_active: AtomicUsize,
    config: H1PoolConfig,
}

impl H1Pool {
    pub fn new(config: H1PoolConfig) -> Self {
        Self {
            groups: DashMap::new(),
            total_active: AtomicUsize::new(0),
            config,
        }
    }

    /// Take a live parked connection, if any.
    pub fn take_idle(self: &Arc<Self>, key: &SessionKey) -> Option<H1Connection> {
        let sender = {
            let mut group = self.groups.entry(key.clone()).or_default();
            loop {
                let idle = group.idle.pop_front()?;
                if !idle.sender.is_closed() {
                    group.active_count += 1;
                    break idle.sender;
                }
                // Dead socket, keep scanning.
            }
        };
        self.total_active.fetch_add(1, Ordering::Relaxed);
        Some(H1Connection {
            sender,
            reused: true,
            guard: SlotGuard {
                pool: Arc::clone(self),
                key: key.clone(),
                armed: true,
            },
        })
    }

    /// True if the group has a parked connection.
    pub fn has_idle(&self, key: &SessionKey) -> bool {
        self.groups
            .get(key)
            .map(|g| !g.idle.is_empty())
            .unwrap_or(false)
    }

    /// Reserve a dial slot, waiting in the group's priority queue when
    /// the group or pool is at its limit.
    pub async fn begin_dial(
        self: &Arc<Self>,
        key: &SessionKey,
        priority: RequestPriority,
    ) -> Result<DialPermit, NetError> {
        loop {
            let rx = {
                let mut group = self.groups.entry(key.clone()).or_default();
                if group.breaker.is_open() {
                    return Err(NetError::TemporarilyThrottled);
                }
                let under_group_limit = group.total_slots() < self.config.max_per_group;
                let under_total_limit =
                    self.total_active.load(Ordering::Relaxed) < self.config.max_total;
                if under_group_limit && under_total_limit {
                    group.active_count += 1;
                    self.total_active.fetch_add(1, Ordering::Relaxed);
                    return Ok(DialPermit {
                        guard: SlotGuard {
                            pool: Arc::clone(self),
                            key: key.clone(),
                            armed: true,
                        },
                    });
                }
                let (tx, rx) = oneshot::channel();
                group.pending.push(PendingWaiter {
                    priority,
                    created_at: Instant::now(),
                    tx,
                });
                rx
            };
            // A released slot wakes us; loop to retry the reservation.
            rx.await.map_err(|_| NetError::ConnectionAborted)?;
        }
    }

    /// A dial reserved with `begin_dial` failed; free the slot.
    pub fn abort_dial(&self, permit: DialPermit) {
        drop(permit);
    }

    /// A dial succeeded; the permit converts into an active connection.
    pub fn commit_dial(
        &self,
        permit: DialPermit,
        sender: http1::SendRequest<OutboundBody>,
    ) -> H1Connection {
        H1Connection {
            sender,
            reused: false,
            guard: permit.guard,
        }
    }

    /// Return a connection after a transaction. `reusable` is false when
    /// the server signaled `Connection: close` or the stream errored.
    pub fn release(&self, conn: H1Connection, reusable: bool) {
        let H1Connection { sender, guard, .. } = conn;
        if reusable && !sender.is_closed() {
            let key = guard.disarm();
            {
                let mut group = self.groups.entry(key.clone()).or_default();
                group.idle.push_back(IdleConn {
                    sender,
                    parked_at: Instant::now(),
                    was_used: true,
                });
            }
            // The active slot frees up; wake a waiter if any.
            self.release_slot(&key);
        } else {
            drop(sender);
            drop(guard);
        }
    }

    /// Park a never-used preconnected sender.
    pub fn park_preconnected(&self, key: &SessionKey, sender: http1::SendRequest<OutboundBody>) {
        let mut group = self.groups.entry(key.clone()).or_default();
        group.idle.push_back(IdleConn {
            sender,
            parked_at: Instant::now(),
            was_used: false,
        });
    }

    /// Feed the group's circuit breaker.
    pub fn record_response_status(&self, key: &SessionKey, status: u16) {
        let mut group = self.groups.entry(key.clone()).or_default();
        let config = self.config.breaker.clone();
        group.breaker.record_status(status, &config);
    }

    pub fn is_throttled(&self, key: &SessionKey) -> bool {
        self.groups
            .get(key)
            .map(|g| g.breaker.is_open())
            .unwrap_or(false)
    }

    fn release_slot(&self, key: &SessionKey) {
        let waiter = {
            let mut group = self.groups.entry(key.clone()).or_default();
            group.active_count = group.active_count.saturating_sub(1);
            self.total_active.fetch_sub(1, Ordering::Relaxed);
            group.pop_highest_priority_waiter()
        };
        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(());
        }
    }

    pub fn total_active_count(&self) -> usize {
        self.total_active.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.groups.iter().map(|g| g.idle.len()).sum()
    }

    /// Evict idle sockets past their keep-alive window and drop empty
    /// groups. Driven by the engine's maintenance timer.
    pub fn cleanup_idle(&self) {
        let now = Instant::now();
        let mut empty_groups = Vec::new();

        for mut entry in self.groups.iter_mut() {
            let group = entry.value_mut();
            group.idle.retain(|idle| {
                let timeout = if idle.was_used {
                    USED_IDLE_TIMEOUT
                } else {
                    UNUSED_IDLE_TIMEOUT
                };
                now.duration_since(idle.parked_at) < timeout && !idle.sender.is_closed()
            });
            if group.idle.is_empty() && group.active_count == 0 && group.pending.is_empty() {
                empty_groups.push(entry.key().clone());
            }
        }

        for key in empty_groups {
            self.groups
                .remove_if(&key, |_, g| g.idle.is_empty() && g.active_count == 0);
        }
    }

    /// Close everything; called from engine shutdown.
    pub fn clear(&self) {
        self.groups.clear();
        self.total_active.store(0, Ordering::Relaxed);
    }
}
