//! The hub's error taxonomy and its JSON-RPC rendering.
//!
//! The hub is a relay: upstream error payloads pass through verbatim (the
//! router handles that path before errors ever reach this type). Everything
//! here is an error the hub itself synthesizes.

use mcpmux_client::ClientError;
use mcpmux_protocol::JsonRpcError;
use serde_json::json;
use thiserror::Error;

/// Application-defined code for retriable overload errors.
const OVERLOADED_CODE: i32 = -32000;

/// Errors synthesized by the hub.
#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed config, unresolved env var, invalid server entry.
    /// Surfaced at startup; the hub refuses to run.
    #[error("config error: {0}")]
    Config(String),

    /// Unreachable upstream, dead child process, write failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Handshake failure or malformed JSON-RPC from an upstream. Routed the
    /// same way as a transport error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Per-call or total deadline exceeded.
    #[error("timed out after {elapsed_ms} ms")]
    Timeout {
        /// Elapsed time when the deadline fired.
        elapsed_ms: u64,
    },

    /// Downstream disconnect or hub shutdown ended the request.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// A public name resolved to nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The per-server in-flight cap is exhausted.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Activation disallowed by policy for the requested source.
    #[error("activation disallowed: {0}")]
    Policy(String),
}

impl HubError {
    /// Render as the JSON-RPC error object sent downstream. The `data`
    /// fields distinguish the hub-synthesized kinds wire-side:
    /// `data.transport` for transport/protocol failures, `data.timeout`
    /// for deadlines, `data.retriable` for overload.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        match self {
            Self::Config(message) => JsonRpcError::internal(message.clone()),
            Self::Transport(message) | Self::Protocol(message) => {
                JsonRpcError::internal(message.clone())
                    .with_data(json!({ "transport": message }))
            }
            Self::Timeout { elapsed_ms } => {
                JsonRpcError::internal(self.to_string())
                    .with_data(json!({ "timeout": elapsed_ms }))
            }
            Self::Cancelled(reason) => JsonRpcError::internal(self.to_string())
                .with_data(json!({ "cancelled": reason })),
            Self::NotFound(message) => JsonRpcError::invalid_params(message.clone()),
            Self::Overloaded(message) => JsonRpcError {
                code: OVERLOADED_CODE,
                message: message.clone(),
                data: Some(json!({ "retriable": true })),
            },
            Self::Policy(message) => JsonRpcError::internal(self.to_string())
                .with_data(json!({ "policy": message })),
        }
    }
}

impl From<ClientError> for HubError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Transport(inner) => Self::Transport(inner.to_string()),
            ClientError::Handshake(message) | ClientError::Protocol(message) => {
                Self::Protocol(message)
            }
            // Upstream error payloads should be relayed verbatim before this
            // conversion; when one does land here, keep the message.
            ClientError::Upstream(error) => Self::Transport(error.to_string()),
            ClientError::Timeout { elapsed_ms } => Self::Timeout { elapsed_ms },
            ClientError::Cancelled => Self::Cancelled("upstream request cancelled".to_string()),
            ClientError::Overloaded { in_flight } => {
                Self::Overloaded(format!("{in_flight} requests in flight"))
            }
            ClientError::NotReady { state } => {
                Self::Transport(format!("upstream not ready (state: {state})"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmux_protocol::JsonRpcErrorCode;
    use pretty_assertions::assert_eq;

    #[test]
    fn timeout_carries_data_field() {
        let error = HubError::Timeout { elapsed_ms: 30_000 }.to_jsonrpc();
        assert_eq!(error.code, JsonRpcErrorCode::InternalError.code());
        assert_eq!(error.data, Some(json!({ "timeout": 30_000 })));
    }

    #[test]
    fn transport_carries_data_field() {
        let error = HubError::Transport("connection refused".to_string()).to_jsonrpc();
        assert_eq!(error.code, -32603);
        assert_eq!(error.data, Some(json!({ "transport": "connection refused" })));
    }

    #[test]
    fn not_found_is_invalid_params() {
        let error = HubError::NotFound("unknown tool: fs_read".to_string()).to_jsonrpc();
        assert_eq!(error.code, -32602);
    }

    #[test]
    fn overload_is_retriable() {
        let error = HubError::Overloaded("64 requests in flight".to_string()).to_jsonrpc();
        assert_eq!(error.code, -32000);
        assert_eq!(error.data, Some(json!({ "retriable": true })));
    }
}
