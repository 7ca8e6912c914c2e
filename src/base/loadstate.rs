/// The externally observable phase of an in-flight request.
/// This roughly matches net/base/load_states.h
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    /// The request is idle.
    #[default]
    Idle,

    /// Waiting for a slot in the session pool.
    WaitingForAvailableSocket,

    /// Waiting for the cache lock.
    WaitingForCache,

    /// Resolving the host.
    ResolvingHost,

    /// Connecting to the host (TCP/QUIC handshake).
    Connecting,

    /// Establishing a TLS session.
    SslHandshake,

    /// Sending the request.
    SendingRequest,

    /// Waiting for the server response (TTFB).
    WaitingForResponse,

    /// Reading the response body.
    ReadingResponse,
}
