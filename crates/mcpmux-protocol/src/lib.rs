//! Wire-level types for the mcpmux hub.
//!
//! This crate is the foundation layer: JSON-RPC 2.0 message types, the MCP
//! domain types the hub actually interprets, and the protocol version
//! registry. It performs no I/O and holds no state.
//!
//! Descriptors the hub merely relays (tool input schemas, resource metadata,
//! prompt arguments) are kept as raw [`serde_json::Value`] bags inside typed
//! envelopes, so nothing is lost between an upstream catalog and the
//! downstream listing.

pub mod jsonrpc;
pub mod types;
pub mod version;

pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, RequestId, ResponseId,
};
pub use types::{
    ClientCapabilities, FeatureSet, Implementation, InitializeRequestParams, InitializeResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    NegotiatedProtocol, ProgressNotificationParams, ProgressToken, PromptDescriptor,
    ResourceDescriptor, ResourceTemplateDescriptor, ServerCapabilities, ToolDescriptor,
};
pub use version::{PROTOCOL_VERSIONS, latest_version, negotiate_downstream, supports_version};

/// Method names the hub routes or emits. Collected here so the router and
/// the tests agree on the exact strings.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Tool catalog listing.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Resource catalog listing.
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Resource content read.
    pub const RESOURCES_READ: &str = "resources/read";
    /// Resource template listing.
    pub const RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
    /// Prompt catalog listing.
    pub const PROMPTS_LIST: &str = "prompts/list";
    /// Prompt expansion.
    pub const PROMPTS_GET: &str = "prompts/get";
    /// Liveness probe.
    pub const PING: &str = "ping";
    /// Progress notification (either direction).
    pub const PROGRESS: &str = "notifications/progress";
    /// Request cancellation notification.
    pub const CANCELLED: &str = "notifications/cancelled";
    /// Tool list mutated.
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    /// Resource list mutated.
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    /// Prompt list mutated.
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}
