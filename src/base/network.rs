//! Network bindings and change notifications.
//!
//! A `NetworkBinding` is an opaque token naming an L3 network a socket can
//! be pinned to. The engine never interprets the token; it only compares
//! it by identity. The host OS integration translates its own network
//! handles into bindings and feeds change events into the
//! `NetworkChangeNotifier`.

use std::fmt;
use tokio::sync::broadcast;

/// Opaque handle identifying an OS-visible L3 network, or unbound.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkBinding(u64);

impl NetworkBinding {
    /// Sockets not pinned to any particular network.
    pub const UNBOUND: NetworkBinding = NetworkBinding(0);

    /// Wrap an OS network handle. Zero is reserved for `UNBOUND`.
    pub fn from_handle(handle: u64) -> Self {
        debug_assert_ne!(handle, 0, "handle 0 is reserved for UNBOUND");
        NetworkBinding(handle)
    }

    pub fn is_bound(&self) -> bool {
        self.0 != 0
    }

    pub fn handle(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NetworkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bound() {
            write!(f, "NetworkBinding({})", self.0)
        } else {
            write!(f, "NetworkBinding(unbound)")
        }
    }
}

/// Events published by the host OS integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChangeEvent {
    /// The default network changed to the given binding.
    DefaultNetworkChanged(NetworkBinding),
    /// A network went away entirely.
    NetworkDisconnected(NetworkBinding),
    /// A non-default network became available (migration target).
    NetworkConnected(NetworkBinding),
    /// The device's IP configuration changed without a network switch.
    IpAddressChanged,
}

/// Fan-out of network change events to sessions and the host cache.
///
/// Observers subscribe before the engine starts serving; late subscribers
/// only see events published after subscription.
#[derive(Debug)]
pub struct NetworkChangeNotifier {
    tx: broadcast::Sender<NetworkChangeEvent>,
    default_network: std::sync::Mutex<NetworkBinding>,
}

impl Default for NetworkChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            tx,
            default_network: std::sync::Mutex::new(NetworkBinding::UNBOUND),
        }
    }

    /// The binding currently considered the OS default.
    pub fn default_network(&self) -> NetworkBinding {
        *self.default_network.lock().unwrap()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkChangeEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Called from host OS glue (and tests).
    pub fn announce(&self, event: NetworkChangeEvent) {
        if let NetworkChangeEvent::DefaultNetworkChanged(binding) = event {
            *self.default_network.lock().unwrap() = binding;
        }
        // No receivers is fine; sessions may not have started yet.
        let _ = self.tx.send(event);
    }
}
