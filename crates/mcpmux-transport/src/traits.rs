//! The shared transport surface.

use async_trait::async_trait;
use mcpmux_protocol::JsonRpcMessage;
use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Which adapter a transport is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Newline-framed stdio to a child process, or LSP-framed process stdio.
    Stdio,
    /// Streamable HTTP (POST + optional SSE-upgraded responses).
    StreamableHttp,
    /// HTTP + SSE with endpoint discovery.
    Sse,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::StreamableHttp => write!(f, "http"),
            Self::Sse => write!(f, "sse"),
        }
    }
}

/// Transport-level failures. These are the errors the lifecycle manager
/// converts into `ERROR`/`COOLDOWN` state changes; nothing in this crate
/// retries.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the underlying connection or spawn the process.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A write to the peer failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A read from the peer failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Bytes arrived that do not frame or parse as JSON-RPC.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The HTTP peer answered with a non-success status.
    #[error("unexpected HTTP status {status}")]
    HttpStatus {
        /// Status code.
        status: u16,
    },

    /// Operation on a transport that is already closed.
    #[error("transport closed")]
    Closed,

    /// Invalid construction parameters.
    #[error("transport configuration: {0}")]
    Configuration(String),

    /// Underlying I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// One JSON-RPC channel to a peer.
///
/// `receive` has single-consumer semantics: exactly one task (the owning
/// client's dispatch loop) may call it. `Ok(None)` means the peer closed
/// cleanly; an `Err` is a transport failure that fails all in-flight work.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which adapter this is.
    fn kind(&self) -> TransportKind;

    /// Establish the channel. Idempotent.
    async fn open(&self) -> TransportResult<()>;

    /// Send one message to the peer.
    async fn send(&self, message: &JsonRpcMessage) -> TransportResult<()>;

    /// Receive the next incoming message.
    async fn receive(&self) -> TransportResult<Option<JsonRpcMessage>>;

    /// Tear the channel down. Idempotent; in-flight reads observe `Closed`
    /// or `Ok(None)`.
    async fn close(&self) -> TransportResult<()>;
}
