//! Transport adapters for the mcpmux hub.
//!
//! Four adapters share one operation surface ([`Transport`]): LSP-style
//! length-framed stdio (downstream), newline-framed child-process stdio
//! (upstream), streamable HTTP (upstream), and SSE (upstream). The adapters
//! are pure byte-level I/O: they frame and unframe JSON-RPC messages and know
//! nothing about MCP semantics.
//!
//! Each adapter feeds incoming messages into a bounded channel with a single
//! consumer; the upstream client's dispatch loop is the only caller of
//! [`Transport::receive`].

mod child;
mod lsp;
mod sse;
mod sse_client;
mod streamable_http;
mod traits;

pub use child::{ChildProcessTransport, ChildSpawnSpec, IoTransport};
pub use traits::{Transport, TransportError, TransportKind, TransportResult};
pub use lsp::{LspCodec, LspFrame};
pub use sse::{SseEvent, SseParser, encode_sse_event, keepalive_frame};
pub use sse_client::{SseClientConfig, SseClientTransport};
pub use streamable_http::{StreamableHttpConfig, StreamableHttpTransport};

/// Session id header used by the streamable HTTP transport, both directions.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
