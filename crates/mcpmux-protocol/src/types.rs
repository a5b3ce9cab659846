//! MCP domain types the hub interprets.
//!
//! Only the fields the hub branches on are modeled; everything else rides in
//! `extra` bags so descriptors survive the relay byte-for-byte.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Client or server identity exchanged during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    pub version: String,
}

/// Capabilities declared by a downstream client in `initialize`.
///
/// The hub only cares whether the client wants list-changed notifications;
/// the rest is opaque.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Everything the client declared, verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities returned by an upstream server in `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tools capability block, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<CapabilityFlags>,
    /// Resources capability block, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<CapabilityFlags>,
    /// Prompts capability block, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<CapabilityFlags>,
    /// Remaining capability blocks, forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Flags common to the tools/resources/prompts capability blocks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityFlags {
    /// The server emits `*/list_changed` notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    /// Resources only: the server supports subscriptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    /// Protocol version the caller wants.
    pub protocol_version: String,
    /// Declared capabilities.
    pub capabilities: ClientCapabilities,
    /// Caller identity.
    pub client_info: Implementation,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Agreed protocol version.
    pub protocol_version: String,
    /// Server capability set.
    pub capabilities: ServerCapabilities,
    /// Server identity.
    pub server_info: Implementation,
    /// Optional free-form usage hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Fixed capability record derived from a handshake. The router branches on
/// these booleans; the raw capability bag is only forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    /// Server exposes tools.
    pub tools: bool,
    /// Server exposes resources.
    pub resources: bool,
    /// Server exposes resource templates.
    pub resource_templates: bool,
    /// Server exposes prompts.
    pub prompts: bool,
    /// Server emits list-changed notifications.
    pub list_changed: bool,
    /// Server understands progress tokens.
    pub progress_tokens: bool,
}

impl FeatureSet {
    /// Derive the fixed record from a server capability set.
    ///
    /// Resource templates ride on the resources capability; progress-token
    /// support is assumed whenever the server declared any capability at all,
    /// since the field is not independently advertised by the protocol.
    pub fn from_capabilities(caps: &ServerCapabilities) -> Self {
        let list_changed = [&caps.tools, &caps.resources, &caps.prompts]
            .into_iter()
            .flatten()
            .any(|flags| flags.list_changed.unwrap_or(false));
        Self {
            tools: caps.tools.is_some(),
            resources: caps.resources.is_some(),
            resource_templates: caps.resources.is_some(),
            prompts: caps.prompts.is_some(),
            list_changed,
            progress_tokens: caps.tools.is_some() || caps.resources.is_some(),
        }
    }

    /// Union of two records; used when merging `assumedCapabilities`.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self {
            tools: self.tools || other.tools,
            resources: self.resources || other.resources,
            resource_templates: self.resource_templates || other.resource_templates,
            prompts: self.prompts || other.prompts,
            list_changed: self.list_changed || other.list_changed,
            progress_tokens: self.progress_tokens || other.progress_tokens,
        }
    }
}

/// Result of a successful upstream handshake.
#[derive(Debug, Clone)]
pub struct NegotiatedProtocol {
    /// Agreed version string.
    pub version: String,
    /// Upstream identity.
    pub server_info: Implementation,
    /// Fixed feature record.
    pub features: FeatureSet,
    /// Raw capability bag, forwarded but never interpreted further.
    pub raw_capabilities: ServerCapabilities,
}

/// Tool descriptor as returned by `tools/list`. `name` is the only field the
/// hub rewrites; the rest is carried in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resource descriptor as returned by `resources/list`. URIs are globally
/// unique already, so they pass through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource URI.
    pub uri: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Resource template descriptor as returned by `resources/templates/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplateDescriptor {
    /// RFC 6570 URI template.
    pub uri_template: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Prompt descriptor as returned by `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name.
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `tools/list` result envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    /// Listed tools.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `resources/list` result envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourcesResult {
    /// Listed resources.
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `resources/templates/list` result envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResourceTemplatesResult {
    /// Listed templates.
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// `prompts/list` result envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPromptsResult {
    /// Listed prompts.
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
    /// Pagination cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Progress token: an integer or a string, carried in `_meta.progressToken`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    /// Numeric token.
    Number(i64),
    /// String token.
    String(String),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for ProgressToken {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl ProgressToken {
    /// Extract the token from a request's `_meta.progressToken`, if present.
    pub fn from_request_params(params: Option<&Value>) -> Option<Self> {
        let token = params?.get("_meta")?.get("progressToken")?;
        serde_json::from_value(token.clone()).ok()
    }
}

/// `notifications/progress` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressNotificationParams {
    /// Token correlating this update with an in-flight request.
    pub progress_token: ProgressToken,
    /// Work completed so far.
    pub progress: f64,
    /// Total work, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Human-readable status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
