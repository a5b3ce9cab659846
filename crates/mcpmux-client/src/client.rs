//! The upstream client.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use mcpmux_protocol::{
    Implementation, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcResponsePayload, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, NegotiatedProtocol, PromptDescriptor,
    ResourceDescriptor, ResourceTemplateDescriptor, ToolDescriptor, methods,
};
use mcpmux_transport::{Transport, TransportError};
use serde_json::{Value, json};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::handshake;
use crate::pending::PendingMap;

/// Default per-server in-flight cap.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Handshake-layer connection state. Distinct from the lifecycle machine:
/// this tracks one transport's journey, not the server's activation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport is being established.
    Connecting,
    /// `initialize` exchange in progress.
    Handshaking,
    /// Accepting requests.
    Ready,
    /// Graceful teardown in progress.
    Closing,
    /// Torn down.
    Closed,
    /// Transport or protocol failure.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Workarounds for non-compliant servers.
#[derive(Debug, Clone, Default)]
pub struct HandshakeQuirks {
    /// Send exactly this version and require it to be echoed.
    pub force_protocol_version: Option<String>,
    /// Send the newest version and accept whatever comes back.
    pub skip_negotiation: bool,
    /// Capabilities to assume on top of whatever the server declares.
    pub assumed_features: Option<mcpmux_protocol::FeatureSet>,
}

/// Construction parameters for one upstream client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The configured server id, used in logs and events.
    pub server_id: String,
    /// Identity the hub presents upstream.
    pub client_info: Implementation,
    /// Bound on the whole handshake (widened by the caller on first runs).
    pub handshake_timeout: Duration,
    /// In-flight request cap.
    pub max_in_flight: usize,
    /// Handshake workarounds.
    pub quirks: HandshakeQuirks,
}

impl ClientConfig {
    /// Config with defaults for `server_id`.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            client_info: Implementation {
                name: "mcpmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            handshake_timeout: Duration::from_secs(30),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            quirks: HandshakeQuirks::default(),
        }
    }
}

/// Events the client surfaces to its owner (the lifecycle manager).
#[derive(Debug)]
pub enum ClientEvent {
    /// A notification arrived from the upstream (progress, list-changed, …).
    Notification(JsonRpcNotification),
    /// The transport went away. `reason` is `None` for a clean peer close.
    Disconnected {
        /// Failure description, when the close was not clean.
        reason: Option<String>,
    },
}

/// One in-flight request. The router awaits `receiver` under its own
/// deadline and cancellation rules; dropping the call releases the
/// in-flight permit.
pub struct PendingCall {
    /// The translated upstream request id.
    pub upstream_id: i64,
    /// Resolves with the upstream's response, or the failure that ended it.
    pub receiver: oneshot::Receiver<Result<JsonRpcResponse, ClientError>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// The catalogs one server contributes to the registry.
#[derive(Debug, Default)]
pub struct Catalog {
    /// Tools, when the server has the capability.
    pub tools: Vec<ToolDescriptor>,
    /// Resources, when the server has the capability.
    pub resources: Vec<ResourceDescriptor>,
    /// Resource templates, when the negotiated features permit the listing.
    pub resource_templates: Vec<ResourceTemplateDescriptor>,
    /// Prompts, when the server has the capability.
    pub prompts: Vec<PromptDescriptor>,
}

/// MCP client for a single upstream server.
///
/// Owns its transport exclusively. One background task consumes the
/// transport's receive side and routes responses into [`PendingMap`];
/// everything else is request/reply over that shared plumbing.
pub struct UpstreamClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    in_flight: Arc<Semaphore>,
    state: StdMutex<ConnectionState>,
    negotiated: StdMutex<Option<NegotiatedProtocol>>,
    events: mpsc::Sender<ClientEvent>,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient")
            .field("state", &self.state.lock().expect("state mutex poisoned"))
            .finish_non_exhaustive()
    }
}

impl UpstreamClient {
    /// Open `transport`, run the handshake, and return a ready client.
    ///
    /// # Errors
    ///
    /// Fails on transport establishment, on handshake rejection, or when
    /// the handshake exceeds its timeout. The transport is closed on any
    /// failure.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        events: mpsc::Sender<ClientEvent>,
    ) -> Result<Arc<Self>, ClientError> {
        let client = Arc::new(Self {
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            transport,
            pending: PendingMap::new(),
            state: StdMutex::new(ConnectionState::Connecting),
            negotiated: StdMutex::new(None),
            events,
        });

        client.transport.open().await?;
        tokio::spawn(Arc::clone(&client).dispatch_loop());

        client.set_state(ConnectionState::Handshaking);
        let timeout = client.config.handshake_timeout;
        let negotiated =
            match tokio::time::timeout(timeout, handshake::negotiate(&client, &client.config))
                .await
            {
                Ok(Ok(negotiated)) => negotiated,
                Ok(Err(error)) => {
                    client.abandon().await;
                    return Err(error);
                }
                Err(_) => {
                    client.abandon().await;
                    return Err(ClientError::Timeout {
                        elapsed_ms: timeout.as_millis() as u64,
                    });
                }
            };

        *client.negotiated.lock().expect("negotiated mutex poisoned") = Some(negotiated);
        client.set_state(ConnectionState::Ready);
        Ok(client)
    }

    /// The configured server id.
    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state mutex poisoned")
    }

    /// The handshake outcome. `None` until `connect` completes.
    pub fn negotiated(&self) -> Option<NegotiatedProtocol> {
        self.negotiated
            .lock()
            .expect("negotiated mutex poisoned")
            .clone()
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.config.max_in_flight - self.in_flight.available_permits()
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state != next {
            debug!(server = %self.config.server_id, from = %state, to = %next, "connection state");
            *state = next;
        }
    }

    /// Send a request and hand back the in-flight call for the caller to
    /// await. This is the router's entry point; deadlines and cancellation
    /// live with the caller.
    ///
    /// # Errors
    ///
    /// `Overloaded` when the in-flight cap is exhausted, `NotReady` outside
    /// the READY state, or the transport failure that prevented the send.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingCall, ClientError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(ClientError::NotReady {
                state: state.to_string(),
            });
        }
        self.send_request_unchecked(method, params).await
    }

    /// As [`Self::send_request`] but without the READY gate; the handshake
    /// itself runs through here.
    pub(crate) async fn send_request_unchecked(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingCall, ClientError> {
        let permit = Arc::clone(&self.in_flight)
            .try_acquire_owned()
            .map_err(|_| ClientError::Overloaded {
                in_flight: self.config.max_in_flight,
            })?;

        let (upstream_id, receiver) = self.pending.register();
        let request = JsonRpcRequest::new(upstream_id, method, params);
        if let Err(error) = self
            .transport
            .send(&JsonRpcMessage::Request(request))
            .await
        {
            self.pending.discard(upstream_id);
            return Err(error.into());
        }
        Ok(PendingCall {
            upstream_id,
            receiver,
            _permit: permit,
        })
    }

    /// Request/reply convenience: await the response and unwrap the result,
    /// surfacing an upstream error payload as [`ClientError::Upstream`].
    ///
    /// # Errors
    ///
    /// Everything [`Self::send_request`] returns, plus `Cancelled` when the
    /// call is dropped before a response arrives.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(ClientError::NotReady {
                state: state.to_string(),
            });
        }
        self.request_unchecked(method, params).await
    }

    pub(crate) async fn request_unchecked(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ClientError> {
        let call = self.send_request_unchecked(method, params).await?;
        match call.receiver.await {
            Ok(Ok(response)) => match response.payload {
                JsonRpcResponsePayload::Success { result } => Ok(result),
                JsonRpcResponsePayload::Error { error } => Err(ClientError::Upstream(error)),
            },
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ClientError::Cancelled),
        }
    }

    /// Send a notification (no response expected).
    ///
    /// # Errors
    ///
    /// Transport failures only.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        self.transport
            .send(&JsonRpcMessage::Notification(JsonRpcNotification::new(
                method, params,
            )))
            .await
            .map_err(Into::into)
    }

    /// Best-effort cancellation of an in-flight request: the waiter is
    /// released immediately, and a `notifications/cancelled` is sent so a
    /// cooperative upstream can stop working. A response that still arrives
    /// is discarded by the dispatch loop.
    pub async fn cancel_request(&self, upstream_id: i64, reason: &str) {
        if self.pending.discard(upstream_id) {
            let params = json!({ "requestId": upstream_id, "reason": reason });
            if let Err(error) = self.notify(methods::CANCELLED, Some(params)).await {
                debug!(server = %self.config.server_id, %error, "cancel notification failed");
            }
        }
    }

    /// Pull the catalogs this server contributes, driven by the negotiated
    /// feature record. Empty results are valid; a missing capability skips
    /// the corresponding list call entirely.
    ///
    /// # Errors
    ///
    /// Propagates the first failing list request.
    pub async fn pull_catalog(&self) -> Result<Catalog, ClientError> {
        let Some(negotiated) = self.negotiated() else {
            return Err(ClientError::NotReady {
                state: self.state().to_string(),
            });
        };
        let features = negotiated.features;
        let mut catalog = Catalog::default();

        if features.tools {
            let value = self.request(methods::TOOLS_LIST, None).await?;
            let result: ListToolsResult = serde_json::from_value(value)
                .map_err(|e| ClientError::Protocol(format!("malformed tools/list: {e}")))?;
            catalog.tools = result.tools;
        }
        if features.resources {
            let value = self.request(methods::RESOURCES_LIST, None).await?;
            let result: ListResourcesResult = serde_json::from_value(value)
                .map_err(|e| ClientError::Protocol(format!("malformed resources/list: {e}")))?;
            catalog.resources = result.resources;
        }
        if features.resource_templates {
            // Gated separately: some servers expose resources but not the
            // template listing, and answer this with an error.
            match self.request(methods::RESOURCES_TEMPLATES_LIST, None).await {
                Ok(value) => {
                    let result: ListResourceTemplatesResult = serde_json::from_value(value)
                        .map_err(|e| {
                            ClientError::Protocol(format!("malformed templates list: {e}"))
                        })?;
                    catalog.resource_templates = result.resource_templates;
                }
                Err(ClientError::Upstream(error)) => {
                    debug!(server = %self.config.server_id, %error, "templates listing declined");
                }
                Err(error) => return Err(error),
            }
        }
        if features.prompts {
            let value = self.request(methods::PROMPTS_LIST, None).await?;
            let result: ListPromptsResult = serde_json::from_value(value)
                .map_err(|e| ClientError::Protocol(format!("malformed prompts/list: {e}")))?;
            catalog.prompts = result.prompts;
        }
        Ok(catalog)
    }

    /// Graceful teardown: in-flight requests are cancelled, the transport
    /// is closed, and the state lands on CLOSED.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closing);
        self.pending.fail_all(|| ClientError::Cancelled);
        if let Err(error) = self.transport.close().await {
            debug!(server = %self.config.server_id, %error, "transport close failed");
        }
        self.set_state(ConnectionState::Closed);
    }

    /// Teardown after a failed connect; keeps FAILED visible rather than
    /// ending on CLOSED.
    async fn abandon(&self) {
        self.pending.fail_all(|| ClientError::Cancelled);
        let _ = self.transport.close().await;
        self.set_state(ConnectionState::Failed);
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            match self.transport.receive().await {
                Ok(Some(JsonRpcMessage::Response(response))) => {
                    let resolved = match response.id.as_request_id() {
                        Some(id) => {
                            let id = id.clone();
                            self.pending.resolve(&id, response)
                        }
                        None => false,
                    };
                    if !resolved {
                        warn!(
                            server = %self.config.server_id,
                            "discarding response with unknown or absent id"
                        );
                    }
                }
                Ok(Some(JsonRpcMessage::Notification(notification))) => {
                    if self
                        .events
                        .send(ClientEvent::Notification(notification))
                        .await
                        .is_err()
                    {
                        debug!(server = %self.config.server_id, "event consumer gone");
                    }
                }
                Ok(Some(JsonRpcMessage::Request(request))) => {
                    // The hub does not service upstream-initiated requests
                    // (sampling, elicitation); decline instead of stalling
                    // the server.
                    let response = JsonRpcResponse::error(
                        request.id.clone(),
                        JsonRpcError::method_not_found(&request.method),
                    );
                    if let Err(error) = self
                        .transport
                        .send(&JsonRpcMessage::Response(response))
                        .await
                    {
                        debug!(server = %self.config.server_id, %error, "decline send failed");
                    }
                }
                Ok(None) => {
                    self.on_disconnect(None).await;
                    break;
                }
                Err(error) => {
                    self.on_disconnect(Some(error.to_string())).await;
                    break;
                }
            }
        }
    }

    async fn on_disconnect(&self, reason: Option<String>) {
        let was_closing = matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        );
        if !was_closing {
            self.set_state(ConnectionState::Failed);
            match &reason {
                Some(reason) => {
                    warn!(server = %self.config.server_id, %reason, "upstream connection lost");
                }
                None => {
                    debug!(server = %self.config.server_id, "upstream closed the connection");
                }
            }
        }
        let failure_reason = reason.clone();
        self.pending.fail_all(|| match &failure_reason {
            Some(reason) => {
                ClientError::Transport(TransportError::ReceiveFailed(reason.clone()))
            }
            None => ClientError::Transport(TransportError::Closed),
        });
        if !was_closing {
            let _ = self.events.send(ClientEvent::Disconnected { reason }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpmux_protocol::FeatureSet;
    use mcpmux_transport::IoTransport;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    /// A scripted upstream server over a duplex pipe.
    struct MockServer {
        reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl MockServer {
        fn stack() -> (Arc<IoTransport>, Self) {
            let (hub_side, server_side) = tokio::io::duplex(64 * 1024);
            let (hub_read, hub_write) = tokio::io::split(hub_side);
            let (server_read, server_write) = tokio::io::split(server_side);
            let transport = Arc::new(IoTransport::new(hub_read, hub_write));
            let server = Self {
                reader: BufReader::new(server_read).lines(),
                writer: server_write,
            };
            (transport, server)
        }

        async fn recv(&mut self) -> Value {
            let line = self.reader.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = serde_json::to_string(&value).unwrap();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        /// Service one handshake: initialize + initialized.
        async fn accept_handshake(&mut self, version: &str) {
            let init = self.recv().await;
            assert_eq!(init["method"], "initialize");
            self.send(json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": version,
                    "capabilities": {"tools": {"listChanged": true}},
                    "serverInfo": {"name": "mock", "version": "0.0.1"}
                }
            }))
            .await;
            let initialized = self.recv().await;
            assert_eq!(initialized["method"], "notifications/initialized");
        }
    }

    fn test_config() -> ClientConfig {
        let mut config = ClientConfig::new("mock");
        config.handshake_timeout = Duration::from_secs(5);
        config
    }

    #[tokio::test]
    async fn connect_negotiates_and_reaches_ready() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);

        let handshake = tokio::spawn(async move {
            server.accept_handshake("2025-06-18").await;
            server
        });
        let client = UpstreamClient::connect(transport, test_config(), events_tx)
            .await
            .unwrap();
        handshake.await.unwrap();

        assert_eq!(client.state(), ConnectionState::Ready);
        let negotiated = client.negotiated().unwrap();
        assert_eq!(negotiated.version, "2025-06-18");
        assert!(negotiated.features.tools);
        assert!(!negotiated.features.prompts);
    }

    #[tokio::test]
    async fn version_walk_falls_back_on_rejection() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);

        let script = tokio::spawn(async move {
            // Reject the first offer outright.
            let first = server.recv().await;
            assert_eq!(first["params"]["protocolVersion"], "2025-06-18");
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": first["id"],
                    "error": {"code": -32602, "message": "unsupported protocol version"}
                }))
                .await;
            // Accept the second.
            server.accept_handshake("2025-03-26").await;
        });

        let client = UpstreamClient::connect(transport, test_config(), events_tx)
            .await
            .unwrap();
        script.await.unwrap();
        assert_eq!(client.negotiated().unwrap().version, "2025-03-26");
    }

    #[tokio::test]
    async fn forced_version_must_be_echoed() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut config = test_config();
        config.quirks.force_protocol_version = Some("2024-11-05".to_string());

        let script = tokio::spawn(async move {
            let init = server.recv().await;
            assert_eq!(init["params"]["protocolVersion"], "2024-11-05");
            // Answer with a different version: the pinned handshake fails.
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": init["id"],
                    "result": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": {},
                        "serverInfo": {"name": "mock", "version": "0.0.1"}
                    }
                }))
                .await;
        });

        let result = UpstreamClient::connect(transport, config, events_tx).await;
        script.await.unwrap();
        assert!(matches!(result, Err(ClientError::Handshake(_))));
    }

    #[tokio::test]
    async fn handshake_timeout_is_enforced() {
        let (transport, _server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut config = test_config();
        config.handshake_timeout = Duration::from_millis(50);

        // The mock never answers.
        let result = UpstreamClient::connect(transport, config, events_tx).await;
        assert!(matches!(result, Err(ClientError::Timeout { elapsed_ms: 50 })));
    }

    #[tokio::test]
    async fn overload_is_rejected_not_queued() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut config = test_config();
        config.max_in_flight = 1;

        let handshake = tokio::spawn(async move {
            server.accept_handshake("2025-06-18").await;
            server
        });
        let client = UpstreamClient::connect(transport, config, events_tx)
            .await
            .unwrap();
        let _server = handshake.await.unwrap();

        let held = client.send_request("tools/call", None).await.unwrap();
        let second = client.send_request("tools/call", None).await;
        assert!(matches!(
            second,
            Err(ClientError::Overloaded { in_flight: 1 })
        ));
        drop(held);
        // Permit released: the next request is admitted again.
        let third = client.send_request("tools/call", None).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn disconnect_fails_pending_and_emits_event() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let handshake = tokio::spawn(async move {
            server.accept_handshake("2025-06-18").await;
            server
        });
        let client = UpstreamClient::connect(transport, test_config(), events_tx)
            .await
            .unwrap();
        let server = handshake.await.unwrap();

        let call = client.send_request("tools/call", None).await.unwrap();
        drop(server); // peer vanishes mid-call

        let outcome = call.receiver.await.unwrap();
        assert!(matches!(outcome, Err(ClientError::Transport(_))));

        let event = events_rx.recv().await.unwrap();
        assert!(matches!(event, ClientEvent::Disconnected { .. }));
        assert_eq!(client.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn assumed_capabilities_extend_the_feature_record() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);
        let mut config = test_config();
        config.quirks.assumed_features = Some(FeatureSet {
            prompts: true,
            ..FeatureSet::default()
        });

        let script = tokio::spawn(async move {
            // Declares nothing; the quirk fills in prompts.
            let init = server.recv().await;
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": init["id"],
                    "result": {
                        "protocolVersion": "2025-06-18",
                        "capabilities": {},
                        "serverInfo": {"name": "mock", "version": "0.0.1"}
                    }
                }))
                .await;
            let _ = server.recv().await;
            server
        });

        let client = UpstreamClient::connect(transport, config, events_tx)
            .await
            .unwrap();
        let _server = script.await.unwrap();
        let features = client.negotiated().unwrap().features;
        assert!(features.prompts);
        assert!(!features.tools);
    }

    #[tokio::test]
    async fn catalog_pull_respects_features_and_namespaces_nothing() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);

        let script = tokio::spawn(async move {
            server.accept_handshake("2025-06-18").await;
            // Features: tools only, so exactly one list call arrives.
            let list = server.recv().await;
            assert_eq!(list["method"], "tools/list");
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": list["id"],
                    "result": {"tools": [{"name": "read_file", "inputSchema": {"type": "object"}}]}
                }))
                .await;
            server
        });

        let client = UpstreamClient::connect(transport, test_config(), events_tx)
            .await
            .unwrap();
        let catalog = client.pull_catalog().await.unwrap();
        let _server = script.await.unwrap();

        assert_eq!(catalog.tools.len(), 1);
        assert_eq!(catalog.tools[0].name, "read_file");
        assert!(catalog.resources.is_empty());
        assert!(catalog.prompts.is_empty());
    }

    #[tokio::test]
    async fn upstream_error_payload_is_preserved() {
        let (transport, mut server) = MockServer::stack();
        let (events_tx, _events_rx) = mpsc::channel(16);

        let script = tokio::spawn(async move {
            server.accept_handshake("2025-06-18").await;
            let call = server.recv().await;
            server
                .send(json!({
                    "jsonrpc": "2.0",
                    "id": call["id"],
                    "error": {"code": -32000, "message": "tool exploded", "data": {"detail": 7}}
                }))
                .await;
            server
        });

        let client = UpstreamClient::connect(transport, test_config(), events_tx)
            .await
            .unwrap();
        let outcome = client.request("tools/call", Some(json!({"name": "x"}))).await;
        let _server = script.await.unwrap();

        match outcome {
            Err(ClientError::Upstream(error)) => {
                assert_eq!(error.code, -32000);
                assert_eq!(error.message, "tool exploded");
                assert_eq!(error.data, Some(json!({"detail": 7})));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }
}
