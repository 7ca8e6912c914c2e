//! QUIC/HTTP3 transport: session driver, migration policy, 0-RTT state.

pub mod config;
pub mod migration;
pub mod server_info;
pub mod session;

pub use config::QuicConfig;
pub use migration::{MigrationAction, MigrationConfig, MigrationController, MigrationState};
pub use server_info::QuicServerInfoStore;
pub use session::{H3Body, H3RequestParts, H3Stream, QuicSession, QuicSessionParams, ResponseHead};
