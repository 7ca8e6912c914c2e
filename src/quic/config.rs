//! QUIC connection configuration.

use crate::base::neterror::NetError;
use std::time::Duration;

/// QUIC/HTTP3 tuning.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Maximum idle timeout once the handshake completed.
    pub idle_timeout: Duration,
    /// Handshake must complete within this long.
    pub crypto_handshake_timeout: Duration,
    /// Idle limit while the crypto handshake is still running.
    pub pre_handshake_idle_timeout: Duration,
    /// Maximum UDP payload size
    pub max_udp_payload_size: u16,
    /// Initial max data (connection-level flow control)
    pub initial_max_data: u64,
    /// Initial max stream data (stream-level flow control)
    pub initial_max_stream_data: u64,
    /// Initial max bidirectional streams
    pub initial_max_streams_bidi: u64,
    /// Initial max unidirectional streams
    pub initial_max_streams_uni: u64,
    /// Enable 0-RTT resumption from stored server configs.
    pub enable_0rtt: bool,
    /// Offered QUIC wire versions, most preferred first. Empty = library
    /// default.
    pub versions: Vec<u32>,
    /// Connection option tags sent to the peer (congestion control etc).
    pub connection_options: Vec<String>,
    /// Client-only connection option tags.
    pub client_connection_options: Vec<String>,
    /// User-agent id carried in the crypto handshake.
    pub handshake_user_agent: Option<String>,
    /// In-memory cap for 0-RTT server configs.
    pub server_configs_cache_size: usize,
    /// First back-off window after QUIC breaks for an origin.
    pub broken_service_initial_delay: Duration,
    /// Double the window on each consecutive breakage.
    pub broken_service_exponential_backoff: bool,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            crypto_handshake_timeout: Duration::from_secs(10),
            pre_handshake_idle_timeout: Duration::from_secs(5),
            max_udp_payload_size: 1350,
            initial_max_data: 10 * 1024 * 1024,   // 10 MB
            initial_max_stream_data: 1024 * 1024, // 1 MB
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            enable_0rtt: true,
            versions: Vec::new(),
            connection_options: Vec::new(),
            client_connection_options: Vec::new(),
            handshake_user_agent: None,
            server_configs_cache_size: 32,
            broken_service_initial_delay: Duration::from_secs(300),
            broken_service_exponential_backoff: true,
        }
    }
}

impl QuicConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the crypto handshake timeout.
    pub fn crypto_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.crypto_handshake_timeout = timeout;
        self
    }

    /// Set initial max data.
    pub fn initial_max_data(mut self, max: u64) -> Self {
        self.initial_max_data = max;
        self
    }

    /// Set initial max stream data.
    pub fn initial_max_stream_data(mut self, max: u64) -> Self {
        self.initial_max_stream_data = max;
        self
    }

    /// Enable or disable 0-RTT.
    pub fn enable_0rtt(mut self, enable: bool) -> Self {
        self.enable_0rtt = enable;
        self
    }

    /// Set the offered QUIC versions.
    pub fn versions(mut self, versions: Vec<u32>) -> Self {
        self.versions = versions;
        self
    }

    /// Build the quiche transport config.
    pub fn to_quiche(&self) -> Result<quiche::Config, NetError> {
        let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)
            .map_err(|_| NetError::QuicProtocolError)?;
        config
            .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
            .map_err(|_| NetError::QuicProtocolError)?;

        config.set_max_idle_timeout(self.idle_timeout.as_millis() as u64);
        config.set_max_recv_udp_payload_size(self.max_udp_payload_size as usize);
        config.set_max_send_udp_payload_size(self.max_udp_payload_size as usize);
        config.set_initial_max_data(self.initial_max_data);
        config.set_initial_max_stream_data_bidi_local(self.initial_max_stream_data);
        config.set_initial_max_stream_data_bidi_remote(self.initial_max_stream_data);
        config.set_initial_max_stream_data_uni(self.initial_max_stream_data);
        config.set_initial_max_streams_bidi(self.initial_max_streams_bidi);
        config.set_initial_max_streams_uni(self.initial_max_streams_uni);
        // Migration is driven by this engine, not refused at the
        // transport layer.
        config.set_disable_active_migration(false);
        // Room for the connection-id pairs used by path probing.
        config.set_active_connection_id_limit(4);
        if self.enable_0rtt {
            config.enable_early_data();
        }
        config.verify_peer(true);

        Ok(config)
    }
}
