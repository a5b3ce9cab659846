//! Client-level failures.

use mcpmux_protocol::JsonRpcError;
use mcpmux_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by [`crate::UpstreamClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport underneath failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The `initialize` exchange failed or no protocol version was agreed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The upstream sent something that is not valid MCP.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The upstream answered with a JSON-RPC error. The payload is kept
    /// intact so the router can relay it unchanged.
    #[error("upstream error: {0}")]
    Upstream(JsonRpcError),

    /// A deadline elapsed before the upstream answered.
    #[error("request timed out after {elapsed_ms} ms")]
    Timeout {
        /// How long we waited.
        elapsed_ms: u64,
    },

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    Cancelled,

    /// The per-server in-flight cap is exhausted.
    #[error("server overloaded: {in_flight} requests in flight")]
    Overloaded {
        /// The cap that was hit.
        in_flight: usize,
    },

    /// The client is not in a state that accepts requests.
    #[error("client not ready (state: {state})")]
    NotReady {
        /// Current connection state.
        state: String,
    },
}
