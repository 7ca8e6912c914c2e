//! Core types shared across the engine: errors, load states, network
//! bindings, and the NetLog event sink.

pub mod loadstate;
pub mod neterror;
pub mod netlog;
pub mod network;

pub use loadstate::LoadState;
pub use neterror::{ErrorCategory, NetError, NetResultExt};
pub use netlog::{NetLog, NetLogEventType};
pub use network::{NetworkBinding, NetworkChangeEvent, NetworkChangeNotifier};
