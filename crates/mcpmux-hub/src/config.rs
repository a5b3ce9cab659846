//! Hub configuration.
//!
//! The file shape is the de-facto MCP config document:
//!
//! ```json
//! {
//!   "hub": { "callTimeoutMs": 30000 },
//!   "mcpServers": {
//!     "fs": { "command": "node", "args": ["server.js"], "activationPolicy": "always" },
//!     "search": { "url": "https://example.com/mcp", "headers": {"authorization": "Bearer ${TOKEN}"} }
//!   }
//! }
//! ```
//!
//! `${VAR}` and `${VAR:-default}` references in string values are expanded
//! against the process environment before validation; an unresolved `${VAR}`
//! without a default is a config error. Each entry is validated into the
//! [`ServerConfig`] sum type before the core ever sees it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mcpmux_protocol::FeatureSet;
use serde::Deserialize;
use tracing::debug;

use crate::error::HubError;

/// Short opaque server identifier, unique within one hub process.
pub type ServerId = String;

/// How an upstream is reached. Exactly one variant per server entry.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    /// Child process speaking newline-delimited JSON-RPC on stdio.
    Stdio {
        /// Executable.
        command: String,
        /// Arguments.
        args: Vec<String>,
        /// Extra environment.
        env: HashMap<String, String>,
        /// Working directory.
        cwd: Option<PathBuf>,
    },
    /// Streamable HTTP endpoint.
    Http {
        /// Endpoint URL.
        url: String,
        /// Headers forwarded verbatim.
        headers: HashMap<String, String>,
    },
    /// HTTP + SSE endpoint (pre-streamable servers).
    Sse {
        /// SSE stream URL.
        url: String,
        /// Headers forwarded verbatim.
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }
}

/// When an upstream is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivationPolicy {
    /// Connected at hub startup; never auto-stopped.
    Always,
    /// Connected on the first routed request; may idle-stop.
    OnDemand,
    /// Connected only by an explicit manual activation.
    #[default]
    Manual,
}

/// When the idle clock is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IdleResetMode {
    /// Reset when a call starts.
    OnCallStart,
    /// Reset when the last in-flight call ends.
    #[default]
    OnCallEnd,
}

/// Automatic-shutdown thresholds for an idle upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdlePolicy {
    /// Idle time before shutdown is considered.
    pub idle_timeout_ms: u64,
    /// Minimum time a server stays up after starting.
    pub min_linger_ms: u64,
    /// When the idle clock resets.
    pub reset: IdleResetMode,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 5 * 60 * 1000,
            min_linger_ms: 30 * 1000,
            reset: IdleResetMode::OnCallEnd,
        }
    }
}

impl IdlePolicy {
    /// Idle threshold as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Linger threshold as a [`Duration`].
    pub fn min_linger(&self) -> Duration {
        Duration::from_millis(self.min_linger_ms)
    }
}

/// Per-server timing bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutsConfig {
    /// Bound on the whole handshake.
    pub handshake_ms: u64,
    /// Bound on transport readiness (SSE endpoint discovery).
    pub ready_ms: u64,
    /// Bound on child-process spawn.
    pub spawn_ms: u64,
    /// Cooldown before a failed server may be retried.
    pub cooldown_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_ms: 30_000,
            ready_ms: 10_000,
            spawn_ms: 10_000,
            cooldown_ms: 30_000,
        }
    }
}

/// Workarounds for non-compliant upstreams.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuirksConfig {
    /// Send exactly this protocol version.
    pub force_protocol_version: Option<String>,
    /// Skip the version walk, accept whatever the server answers.
    pub skip_negotiation: bool,
    /// Capabilities to assume regardless of the handshake
    /// (`"tools"`, `"resources"`, `"prompts"`).
    pub assumed_capabilities: Vec<String>,
    /// Fresh install that may download dependencies on first spawn; widens
    /// the handshake timeout to 90 s.
    pub is_first_run: bool,
}

impl QuirksConfig {
    /// The assumed-capability strings as a feature record, when any are set.
    pub fn assumed_features(&self) -> Option<FeatureSet> {
        if self.assumed_capabilities.is_empty() {
            return None;
        }
        let mut features = FeatureSet::default();
        for capability in &self.assumed_capabilities {
            match capability.as_str() {
                "tools" => features.tools = true,
                "resources" => {
                    features.resources = true;
                    features.resource_templates = true;
                }
                "prompts" => features.prompts = true,
                other => debug!(capability = %other, "ignoring unknown assumed capability"),
            }
        }
        Some(features)
    }

    /// Effective handshake timeout given the configured base.
    pub fn handshake_timeout(&self, timeouts: &TimeoutsConfig) -> Duration {
        if self.is_first_run {
            Duration::from_secs(90)
        } else {
            Duration::from_millis(timeouts.handshake_ms)
        }
    }
}

/// Immutable description of one upstream server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Configured id.
    pub id: ServerId,
    /// How to reach it.
    pub transport: TransportConfig,
    /// When to connect it.
    pub activation: ActivationPolicy,
    /// When to stop it.
    pub idle: IdlePolicy,
    /// Timing bounds.
    pub timeouts: TimeoutsConfig,
    /// Workarounds.
    pub quirks: QuirksConfig,
}

/// Hub-wide knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Per-call deadline.
    pub call_timeout_ms: u64,
    /// Hard cap on one call even with progress resets.
    pub max_total_timeout_ms: u64,
    /// Extend the per-call deadline whenever progress arrives.
    pub reset_timeout_on_progress: bool,
    /// Downstream session TTL.
    pub session_ttl_seconds: u64,
    /// Grace period for in-flight requests at shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            max_total_timeout_ms: 5 * 60 * 1000,
            reset_timeout_on_progress: false,
            session_ttl_seconds: 3600,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl HubSettings {
    /// Per-call deadline as a [`Duration`].
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Total cap as a [`Duration`].
    pub fn max_total_timeout(&self) -> Duration {
        Duration::from_millis(self.max_total_timeout_ms)
    }

    /// Shutdown grace as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Validated hub configuration.
#[derive(Debug, Clone, Default)]
pub struct HubConfig {
    /// Hub-wide knobs.
    pub settings: HubSettings,
    /// Enabled upstream servers.
    pub servers: Vec<ServerConfig>,
}

// ---------------------------------------------------------------------------
// Raw file shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawConfigFile {
    #[serde(default)]
    hub: HubSettings,
    #[serde(default)]
    mcp_servers: HashMap<String, RawServerEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawServerEntry {
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    url: Option<String>,
    headers: HashMap<String, String>,
    #[serde(rename = "type")]
    transport_type: Option<String>,
    activation_policy: Option<ActivationPolicy>,
    idle_policy: Option<IdlePolicy>,
    timeouts: Option<TimeoutsConfig>,
    quirks: Option<QuirksConfig>,
    disabled: bool,
}

impl HubConfig {
    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// [`HubError::Config`] for unreadable files, malformed JSON, unresolved
    /// env vars, or invalid server entries.
    pub fn load(path: &Path) -> Result<Self, HubError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HubError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text)
    }

    /// Parse and validate a config document.
    ///
    /// # Errors
    ///
    /// See [`Self::load`].
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let raw: RawConfigFile = serde_json::from_str(text)
            .map_err(|e| HubError::Config(format!("malformed config: {e}")))?;

        let mut servers = Vec::new();
        let mut ids: Vec<&String> = raw.mcp_servers.keys().collect();
        ids.sort();
        for id in ids {
            let entry = &raw.mcp_servers[id];
            if entry.disabled {
                debug!(server = %id, "skipping disabled server");
                continue;
            }
            servers.push(entry.validate(id)?);
        }
        Ok(Self {
            settings: raw.hub,
            servers,
        })
    }
}

impl RawServerEntry {
    fn validate(&self, id: &str) -> Result<ServerConfig, HubError> {
        let transport = self.transport(id)?;
        Ok(ServerConfig {
            id: id.to_string(),
            transport,
            activation: self.activation_policy.unwrap_or_default(),
            idle: self.idle_policy.clone().unwrap_or_default(),
            timeouts: self.timeouts.clone().unwrap_or_default(),
            quirks: self.quirks.clone().unwrap_or_default(),
        })
    }

    fn transport(&self, id: &str) -> Result<TransportConfig, HubError> {
        let kind = match self.transport_type.as_deref() {
            Some("http") => "http",
            Some("sse") => "sse",
            Some(other) => {
                return Err(HubError::Config(format!(
                    "server '{id}': unknown transport type '{other}'"
                )));
            }
            None if self.command.is_some() => "stdio",
            None if self.url.is_some() => "http",
            None => {
                return Err(HubError::Config(format!(
                    "server '{id}': needs either 'command' or 'url'"
                )));
            }
        };

        match kind {
            "stdio" => {
                let command = self.command.as_ref().ok_or_else(|| {
                    HubError::Config(format!("server '{id}': stdio transport needs 'command'"))
                })?;
                Ok(TransportConfig::Stdio {
                    command: expand_env(command)?,
                    args: self
                        .args
                        .iter()
                        .map(|arg| expand_env(arg))
                        .collect::<Result<_, _>>()?,
                    env: expand_env_map(&self.env)?,
                    cwd: self
                        .cwd
                        .as_deref()
                        .map(expand_env)
                        .transpose()?
                        .map(PathBuf::from),
                })
            }
            _ => {
                let url = self.url.as_ref().ok_or_else(|| {
                    HubError::Config(format!("server '{id}': {kind} transport needs 'url'"))
                })?;
                let url = expand_env(url)?;
                let headers = expand_env_map(&self.headers)?;
                if kind == "sse" {
                    Ok(TransportConfig::Sse { url, headers })
                } else {
                    Ok(TransportConfig::Http { url, headers })
                }
            }
        }
    }
}

/// Expand `${VAR}` and `${VAR:-default}` references against the process
/// environment.
///
/// # Errors
///
/// [`HubError::Config`] when a referenced variable is unset and carries no
/// default.
pub fn expand_env(input: &str) -> Result<String, HubError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(HubError::Config(format!(
                "unterminated '${{' reference in '{input}'"
            )));
        };
        let reference = &after[..end];
        let (name, default) = match reference.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (reference, None),
        };
        match std::env::var(name) {
            Ok(value) => output.push_str(&value),
            Err(_) => match default {
                Some(default) => output.push_str(default),
                None => {
                    return Err(HubError::Config(format!(
                        "environment variable '{name}' is not set (referenced in '{input}')"
                    )));
                }
            },
        }
        rest = &after[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

fn expand_env_map(map: &HashMap<String, String>) -> Result<HashMap<String, String>, HubError> {
    map.iter()
        .map(|(key, value)| Ok((key.clone(), expand_env(value)?)))
        .collect()
}
