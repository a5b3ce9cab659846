//! Downstream request router.
//!
//! Accepts JSON-RPC from downstream sessions, resolves public names through
//! the registry, drives on-demand activation, forwards calls with translated
//! ids, and applies per-call deadlines with optional progress-driven resets.
//! Upstream result and error payloads are relayed verbatim; only the id is
//! rewritten.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use mcpmux_protocol::{
    InitializeRequestParams, InitializeResult, Implementation, JsonRpcError, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ProgressToken, RequestId,
    ServerCapabilities, methods, negotiate_downstream,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{HubSettings, ServerId};
use crate::error::HubError;
use crate::fanout::FanoutManager;
use crate::lifecycle::{ActivationSource, LifecycleManager};
use crate::registry::Registry;
use crate::session::SessionStore;

/// Which catalog a forwarded call resolves against.
#[derive(Clone, Copy)]
enum CallKind {
    Tool,
    Resource,
    Prompt,
}

/// The router. One instance serves every downstream endpoint.
pub struct Router {
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionStore>,
    fanout: Arc<FanoutManager>,
    settings: HubSettings,
    shutting_down: AtomicBool,
    in_flight: AtomicUsize,
    session_tokens: Mutex<HashMap<String, CancellationToken>>,
    progress_watch: Mutex<HashMap<ProgressToken, Arc<Notify>>>,
}

impl Router {
    /// Wire a router over the shared components.
    pub fn new(
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleManager>,
        sessions: Arc<SessionStore>,
        fanout: Arc<FanoutManager>,
        settings: HubSettings,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            sessions,
            fanout,
            settings,
            shutting_down: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            session_tokens: Mutex::new(HashMap::new()),
            progress_watch: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one downstream message. Requests produce a response;
    /// notifications and stray responses produce none.
    pub async fn handle_message(
        self: &Arc<Self>,
        session_id: &str,
        message: JsonRpcMessage,
    ) -> Option<JsonRpcResponse> {
        self.handle_message_routed(session_id, session_id, message)
            .await
    }

    /// As [`Self::handle_message`], but progress frames for this message's
    /// token route to `sink_id` instead of the session's own stream. The
    /// streamable-HTTP endpoint uses this for SSE-upgraded POSTs, which get
    /// a per-request stream.
    pub async fn handle_message_routed(
        self: &Arc<Self>,
        session_id: &str,
        sink_id: &str,
        message: JsonRpcMessage,
    ) -> Option<JsonRpcResponse> {
        self.sessions.create_or_touch(session_id, Instant::now());
        match message {
            JsonRpcMessage::Request(request) => {
                Some(self.handle_request(session_id, sink_id, request).await)
            }
            JsonRpcMessage::Notification(notification) => {
                self.handle_notification(session_id, &notification);
                None
            }
            JsonRpcMessage::Response(_) => {
                debug!(session = %session_id, "ignoring stray response from downstream");
                None
            }
        }
    }

    fn handle_notification(&self, session_id: &str, notification: &JsonRpcNotification) {
        match notification.method.as_str() {
            methods::INITIALIZED => {
                debug!(session = %session_id, "session initialized");
            }
            other => {
                debug!(session = %session_id, method = %other, "ignoring notification");
            }
        }
    }

    async fn handle_request(
        self: &Arc<Self>,
        session_id: &str,
        sink_id: &str,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        if self.shutting_down.load(Ordering::SeqCst) {
            return JsonRpcResponse::error(
                request.id,
                HubError::Cancelled("hub is shutting down".to_string()).to_jsonrpc(),
            );
        }

        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        match method.as_str() {
            methods::INITIALIZE => self.handle_initialize(session_id, id, params),
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::TOOLS_LIST => {
                JsonRpcResponse::success(id, json!({ "tools": self.registry.list_tools() }))
            }
            methods::RESOURCES_LIST => JsonRpcResponse::success(
                id,
                json!({ "resources": self.registry.list_resources() }),
            ),
            methods::RESOURCES_TEMPLATES_LIST => JsonRpcResponse::success(
                id,
                json!({ "resourceTemplates": self.registry.list_resource_templates() }),
            ),
            methods::PROMPTS_LIST => JsonRpcResponse::success(
                id,
                json!({ "prompts": self.registry.list_prompts() }),
            ),
            methods::TOOLS_CALL => {
                self.handle_call(session_id, sink_id, id, CallKind::Tool, params)
                    .await
            }
            methods::RESOURCES_READ => {
                self.handle_call(session_id, sink_id, id, CallKind::Resource, params)
                    .await
            }
            methods::PROMPTS_GET => {
                self.handle_call(session_id, sink_id, id, CallKind::Prompt, params)
                    .await
            }
            other => JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
        }
    }

    fn handle_initialize(
        &self,
        session_id: &str,
        id: RequestId,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let requested = params
            .as_ref()
            .and_then(|p| serde_json::from_value::<InitializeRequestParams>(p.clone()).ok());
        let version = match &requested {
            Some(init) => negotiate_downstream(&init.protocol_version),
            None => negotiate_downstream(""),
        };
        self.sessions.set_protocol_version(session_id, version);
        if let Some(init) = &requested {
            debug!(
                session = %session_id,
                client = %init.client_info.name,
                version = %version,
                "downstream initialized"
            );
        }

        // The hub claims a capability iff any routable upstream has it. The
        // list-changed flags are the hub's own: it emits those notifications
        // whenever the registry mutates.
        let features = self.lifecycle.active_features();
        let mut capabilities = serde_json::Map::new();
        if features.tools {
            capabilities.insert("tools".to_string(), json!({ "listChanged": true }));
        }
        if features.resources {
            capabilities.insert("resources".to_string(), json!({ "listChanged": true }));
        }
        if features.prompts {
            capabilities.insert("prompts".to_string(), json!({ "listChanged": true }));
        }

        let result = InitializeResult {
            protocol_version: version.to_string(),
            capabilities: serde_json::from_value::<ServerCapabilities>(Value::Object(
                capabilities,
            ))
            .unwrap_or_default(),
            server_info: Implementation {
                name: "mcpmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        };
        match serde_json::to_value(&result) {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(
                id,
                JsonRpcError::internal(format!("initialize serialization: {error}")),
            ),
        }
    }

    async fn handle_call(
        self: &Arc<Self>,
        session_id: &str,
        sink_id: &str,
        id: RequestId,
        kind: CallKind,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let (method, key_field) = match kind {
            CallKind::Tool => (methods::TOOLS_CALL, "name"),
            CallKind::Resource => (methods::RESOURCES_READ, "uri"),
            CallKind::Prompt => (methods::PROMPTS_GET, "name"),
        };

        let Some(public) = params
            .as_ref()
            .and_then(|p| p.get(key_field))
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_params(format!("missing '{key_field}' parameter")),
            );
        };

        let (server_id, original) = match self.resolve_or_activate(kind, &public).await {
            Ok(hit) => hit,
            Err(error) => return JsonRpcResponse::error(id, error.to_jsonrpc()),
        };

        // Rewrite the public name back to what the upstream knows. Resource
        // URIs pass through unchanged (public == original).
        let mut forwarded = params.unwrap_or_else(|| json!({}));
        if let Some(object) = forwarded.as_object_mut()
            && key_field == "name"
        {
            object.insert("name".to_string(), Value::String(original.clone()));
        }

        let tool_name = match kind {
            CallKind::Tool => Some(original.clone()),
            _ => None,
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .forward(
                session_id,
                sink_id,
                &server_id,
                method,
                forwarded,
                tool_name.as_deref(),
            )
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(response) => response.with_id(id),
            Err(error) => JsonRpcResponse::error(id, error.to_jsonrpc()),
        }
    }

    fn resolve(&self, kind: CallKind, public: &str) -> Option<(ServerId, String)> {
        match kind {
            CallKind::Tool => self.registry.resolve_tool(public),
            CallKind::Resource => self.registry.resolve_resource(public),
            CallKind::Prompt => self.registry.resolve_prompt(public),
        }
    }

    /// Resolve a public name, activating its likely owner when nothing is
    /// registered yet. A cold `onDemand` server has no registry entries, so
    /// the first routed request must find it by the `{serverId}_` prefix of
    /// the public name, bring it up, and resolve again.
    async fn resolve_or_activate(
        self: &Arc<Self>,
        kind: CallKind,
        public: &str,
    ) -> Result<(ServerId, String), HubError> {
        if let Some(hit) = self.resolve(kind, public) {
            return Ok(hit);
        }

        // Resource URIs carry no server prefix; only tools and prompts can
        // wake their owner by name.
        if matches!(kind, CallKind::Resource) {
            return Err(HubError::NotFound(format!("not found: {public}")));
        }

        let mut candidates: Vec<ServerId> = self
            .lifecycle
            .server_ids()
            .into_iter()
            .filter(|id| public.starts_with(&format!("{}_", id.replace('.', "_"))))
            .collect();
        // Prefer the most specific id ("a_b" over "a" for "a_b_c").
        candidates.sort_by_key(|id| std::cmp::Reverse(id.len()));

        for server_id in candidates {
            if self.lifecycle.client(&server_id).is_some() {
                // Already up; its catalog simply does not have this name.
                continue;
            }
            match self
                .lifecycle
                .activate(&server_id, ActivationSource::Route)
                .await
            {
                Ok(_) => {
                    if let Some(hit) = self.resolve(kind, public) {
                        return Ok(hit);
                    }
                }
                Err(HubError::Policy(reason)) => {
                    debug!(server = %server_id, %reason, "prefix candidate not activatable");
                }
                Err(error) => return Err(error),
            }
        }
        Err(HubError::NotFound(format!("not found: {public}")))
    }

    async fn forward(
        self: &Arc<Self>,
        session_id: &str,
        sink_id: &str,
        server_id: &ServerId,
        method: &str,
        params: Value,
        tool_name: Option<&str>,
    ) -> Result<JsonRpcResponse, HubError> {
        // Activate on demand; an already-routable server returns its client
        // immediately.
        let client = match self.lifecycle.client(server_id) {
            Some(client) => client,
            None => {
                self.lifecycle
                    .activate(server_id, ActivationSource::Route)
                    .await?
            }
        };

        let progress_token = ProgressToken::from_request_params(Some(&params));
        let progress_notify = if let Some(token) = &progress_token {
            self.fanout.register_token(token.clone(), sink_id);
            if self.settings.reset_timeout_on_progress {
                let notify = Arc::new(Notify::new());
                self.progress_watch
                    .lock()
                    .insert(token.clone(), Arc::clone(&notify));
                Some(notify)
            } else {
                None
            }
        } else {
            None
        };

        self.lifecycle
            .track_activity_start(server_id, session_id, tool_name, Instant::now());

        let result = self
            .await_with_deadline(session_id, &client, method, params, progress_notify.clone())
            .await;

        self.lifecycle.track_activity_end(server_id, Instant::now());
        // The fan-out keeps the token → sink mapping until the sink goes
        // away: a progress notification may still be in flight behind the
        // response. Only the deadline-reset watch is ours to drop.
        if let Some(token) = &progress_token
            && progress_notify.is_some()
        {
            self.progress_watch.lock().remove(token);
        }
        result
    }

    async fn await_with_deadline(
        self: &Arc<Self>,
        session_id: &str,
        client: &Arc<mcpmux_client::UpstreamClient>,
        method: &str,
        params: Value,
        progress_notify: Option<Arc<Notify>>,
    ) -> Result<JsonRpcResponse, HubError> {
        let mut call = client.send_request(method, Some(params)).await?;

        let started = Instant::now();
        let call_timeout = self.settings.call_timeout();
        let max_deadline = tokio::time::Instant::now() + self.settings.max_total_timeout();
        let mut deadline = tokio::time::Instant::now() + call_timeout;
        let cancel = self.session_token(session_id);
        // A dummy Notify that is never signalled keeps the select arm inert
        // when progress resets are off.
        let progress = progress_notify.unwrap_or_default();

        loop {
            tokio::select! {
                outcome = &mut call.receiver => {
                    return match outcome {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(error)) => Err(error.into()),
                        Err(_) => Err(HubError::Cancelled(
                            "upstream request cancelled".to_string(),
                        )),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    client
                        .cancel_request(call.upstream_id, "deadline exceeded")
                        .await;
                    return Err(HubError::Timeout {
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
                _ = cancel.cancelled() => {
                    client
                        .cancel_request(call.upstream_id, "client disconnected")
                        .await;
                    return Err(HubError::Cancelled(
                        "downstream disconnected".to_string(),
                    ));
                }
                _ = progress.notified() => {
                    // Progress arrived: push the deadline out, capped by the
                    // total limit.
                    deadline = (tokio::time::Instant::now() + call_timeout).min(max_deadline);
                }
            }
        }
    }

    /// Signal progress arrival for deadline resets. Called by the hub's
    /// upstream-notice loop alongside the fan-out delivery.
    pub fn notify_progress(&self, token: &ProgressToken) {
        if let Some(notify) = self.progress_watch.lock().get(token) {
            notify.notify_one();
        }
    }

    fn session_token(&self, session_id: &str) -> CancellationToken {
        self.session_tokens
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Cancel every pending request of one session (disconnect, DELETE,
    /// expiry).
    pub fn cancel_session(&self, session_id: &str) {
        if let Some(token) = self.session_tokens.lock().remove(session_id) {
            token.cancel();
        }
    }

    /// Stop accepting new requests.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Cancel everything still pending (end of the shutdown grace).
    pub fn cancel_all_sessions(&self) {
        let tokens: Vec<CancellationToken> =
            self.session_tokens.lock().drain().map(|(_, t)| t).collect();
        for token in tokens {
            token.cancel();
        }
    }

    /// Forwarded calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubSettings;
    use crate::registry::ListChanged;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn router() -> (Arc<Router>, mpsc::Receiver<ListChanged>) {
        let (registry_tx, registry_rx) = mpsc::channel(64);
        let registry = Arc::new(Registry::new(registry_tx));
        let (notices_tx, notices_rx) = mpsc::channel(64);
        std::mem::forget(notices_rx);
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&registry), notices_tx));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(3600)));
        let fanout = Arc::new(FanoutManager::new());
        (
            Arc::new(Router::new(
                registry,
                lifecycle,
                sessions,
                fanout,
                HubSettings::default(),
            )),
            registry_rx,
        )
    }

    fn request(id: i64, method: &str, params: Option<Value>) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params))
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let (router, _rx) = router();
        let response = router
            .handle_message("s", request(1, "bogus/method", None))
            .await
            .unwrap();
        match response.payload {
            mcpmux_protocol::JsonRpcResponsePayload::Error { error } => {
                assert_eq!(error.code, -32601);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ping_answers_empty_object() {
        let (router, _rx) = router();
        let response = router
            .handle_message("s", request(1, "ping", None))
            .await
            .unwrap();
        assert_eq!(response.result(), Some(&json!({})));
    }

    #[tokio::test]
    async fn initialize_reports_hub_identity_and_echoes_version() {
        let (router, _rx) = router();
        let response = router
            .handle_message(
                "s",
                request(
                    1,
                    "initialize",
                    Some(json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "clientInfo": {"name": "test", "version": "0"}
                    })),
                ),
            )
            .await
            .unwrap();
        let result = response.result().unwrap();
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert_eq!(result["serverInfo"]["name"], "mcpmux");
        // No routable upstream: no capability claimed.
        assert_eq!(result["capabilities"], json!({}));
        // The session recorded the negotiated version.
        assert_eq!(
            router.sessions.get("s").unwrap().protocol_version.as_deref(),
            Some("2024-11-05")
        );
    }

    #[tokio::test]
    async fn list_methods_return_registry_contents() {
        let (router, _rx) = router();
        router.registry.register_server_tools(
            "fs",
            &[serde_json::from_value(json!({"name": "read_file"})).unwrap()],
        );
        let response = router
            .handle_message("s", request(7, "tools/list", None))
            .await
            .unwrap();
        let result = response.result().unwrap();
        assert_eq!(result["tools"][0]["name"], "fs_read_file");
        assert_eq!(
            response.id.as_request_id(),
            Some(&mcpmux_protocol::RequestId::Number(7))
        );
    }

    #[tokio::test]
    async fn call_with_unknown_name_is_not_found() {
        let (router, _rx) = router();
        let response = router
            .handle_message(
                "s",
                request(2, "tools/call", Some(json!({"name": "ghost_tool"}))),
            )
            .await
            .unwrap();
        match response.payload {
            mcpmux_protocol::JsonRpcResponsePayload::Error { error } => {
                assert_eq!(error.code, -32602);
                assert!(error.message.contains("ghost_tool"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_without_name_is_invalid_params() {
        let (router, _rx) = router();
        let response = router
            .handle_message("s", request(2, "tools/call", Some(json!({}))))
            .await
            .unwrap();
        match response.payload {
            mcpmux_protocol::JsonRpcResponsePayload::Error { error } => {
                assert_eq!(error.code, -32602);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_produce_no_response() {
        let (router, _rx) = router();
        let outcome = router
            .handle_message(
                "s",
                JsonRpcMessage::Notification(JsonRpcNotification::new(
                    "notifications/initialized",
                    None,
                )),
            )
            .await;
        assert!(outcome.is_none());
        // The session was still created.
        assert!(router.sessions.get("s").is_some());
    }

    #[tokio::test]
    async fn shutdown_rejects_new_requests() {
        let (router, _rx) = router();
        router.begin_shutdown();
        let response = router
            .handle_message("s", request(3, "tools/list", None))
            .await
            .unwrap();
        match response.payload {
            mcpmux_protocol::JsonRpcResponsePayload::Error { error } => {
                assert!(error.message.contains("shutting down"));
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
