//! # corenet
//!
//! An HTTP client engine that multiplexes requests over HTTP/1.1,
//! HTTP/2, and HTTP/3 (QUIC), with a stale-aware DNS resolver, QUIC
//! connection migration, and an HTTP cache.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use corenet::{DirectExecutor, Engine};
//! use std::sync::Arc;
//!
//! let engine = Engine::builder()
//!     .enable_quic(true)
//!     .build()?;
//! let request = engine
//!     .new_request_builder("https://example.com/", Arc::new(DirectExecutor), callback)?
//!     .build();
//! request.start()?;
//! ```
//!
//! ## Modules
//!
//! - [`base`] - Errors, load states, network bindings, NetLog
//! - [`dns`] - Host resolution with TTL cache and stale policy
//! - [`pool`] - Session pool, HTTP/1.1 pool, connection establishment
//! - [`h2session`] - HTTP/2 multiplexed sessions
//! - [`quic`] - QUIC/HTTP3 sessions and connection migration
//! - [`request`] - URL request state machine and callbacks
//! - [`cache`] - HTTP cache (memory and disk modes)
//! - [`security`] - Public key pinning
//! - [`engine`] - The engine façade and configuration

pub mod base;
pub mod cache;
pub mod dns;
pub mod engine;
pub mod h2session;
pub mod pool;
pub mod quic;
pub mod request;
pub mod security;

pub use base::neterror::{ErrorCategory, NetError};
pub use base::network::{NetworkBinding, NetworkChangeEvent, NetworkChangeNotifier};
pub use cache::CacheMode;
pub use engine::{DirectExecutor, DnsOptions, Engine, EngineBuilder, EngineOptions, Executor};
pub use quic::{MigrationConfig, QuicConfig};
pub use request::{
    BidirectionalStreamCallback, RequestFinishedListener, RequestState, UrlRequest,
    UrlRequestBuilder, UrlRequestCallback, UrlResponseInfo,
};
