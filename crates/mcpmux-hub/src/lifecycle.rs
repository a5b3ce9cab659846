//! Upstream server lifecycle.
//!
//! One state machine per configured server, driving activation policy, idle
//! shutdown, and failure cooldown. All transitions for one server are
//! serialized through a keyed mutex slot; concurrent activations of the same
//! server share the one that is in flight (the first caller performs the
//! handshake, the rest observe ACTIVE once the slot frees). Different servers
//! proceed in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mcpmux_client::{ClientConfig, ClientEvent, HandshakeQuirks, UpstreamClient};
use mcpmux_protocol::{FeatureSet, Implementation, JsonRpcNotification};
use mcpmux_transport::{
    ChildProcessTransport, ChildSpawnSpec, SseClientConfig, SseClientTransport,
    StreamableHttpConfig, StreamableHttpTransport, Transport,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{ActivationPolicy, IdleResetMode, ServerConfig, ServerId, TransportConfig};
use crate::error::HubError;
use crate::registry::Registry;

/// Lifecycle state of one upstream server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waits for an explicit manual activation.
    Manual,
    /// Not running; may be activated per policy.
    Inactive,
    /// Activation in flight.
    Activating,
    /// Running with work in flight (or freshly started).
    Active,
    /// Running with nothing in flight; idle clock armed.
    Idling,
    /// Teardown in flight.
    Stopping,
    /// Last activation or connection failed.
    Error,
    /// Failure backoff; moves to INACTIVE once the retry delay lapses.
    Cooldown,
}

impl ServerState {
    /// Only ACTIVE and IDLING accept forwarded requests.
    pub fn is_routable(self) -> bool {
        matches!(self, Self::Active | Self::Idling)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Manual => "manual",
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Idling => "idling",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Cooldown => "cooldown",
        };
        write!(f, "{name}")
    }
}

/// Who is asking for an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationSource {
    /// Hub startup (policy `always`).
    Startup,
    /// A routed request targeting the server (policy `onDemand`).
    Route,
    /// Explicit operator action.
    Manual,
}

/// Per-server usage bookkeeping while the server runs.
#[derive(Debug, Clone)]
pub struct ActivityRecord {
    /// Outstanding in-flight requests.
    pub reference_count: usize,
    /// Last time the idle clock was reset.
    pub last_activity_at: Instant,
    /// When this incarnation started.
    pub started_at: Instant,
    /// Sessions with work routed here.
    pub active_sessions: HashSet<String>,
    /// Calls per tool (original names).
    pub tool_calls: HashMap<String, u64>,
    /// All forwarded calls.
    pub total_calls: u64,
}

impl ActivityRecord {
    fn new(now: Instant) -> Self {
        Self {
            reference_count: 0,
            last_activity_at: now,
            started_at: now,
            active_sessions: HashSet::new(),
            tool_calls: HashMap::new(),
            total_calls: 0,
        }
    }
}

/// Notification pulled off an upstream connection, forwarded to the hub's
/// event loop (progress routing, catalog refresh).
#[derive(Debug)]
pub struct UpstreamNotice {
    /// Originating server.
    pub server_id: ServerId,
    /// The notification, verbatim.
    pub notification: JsonRpcNotification,
}

struct ServerRuntime {
    config: ServerConfig,
    /// Keyed mutex slot: every transition for this server runs under it.
    slot: tokio::sync::Mutex<()>,
    state: Mutex<ServerState>,
    client: Mutex<Option<Arc<UpstreamClient>>>,
    activity: Mutex<Option<ActivityRecord>>,
    cooldown_until: Mutex<Option<Instant>>,
}

impl ServerRuntime {
    fn new(config: ServerConfig) -> Self {
        let initial = match config.activation {
            ActivationPolicy::Manual => ServerState::Manual,
            _ => ServerState::Inactive,
        };
        Self {
            config,
            slot: tokio::sync::Mutex::new(()),
            state: Mutex::new(initial),
            client: Mutex::new(None),
            activity: Mutex::new(None),
            cooldown_until: Mutex::new(None),
        }
    }

    fn state(&self) -> ServerState {
        *self.state.lock()
    }

    fn set_state(&self, next: ServerState) {
        let mut state = self.state.lock();
        if *state != next {
            debug!(server = %self.config.id, from = %state, to = %next, "server state");
            *state = next;
        }
    }

    fn client(&self) -> Option<Arc<UpstreamClient>> {
        self.client.lock().clone()
    }
}

/// The lifecycle manager. Owns every upstream client object.
pub struct LifecycleManager {
    servers: RwLock<HashMap<ServerId, Arc<ServerRuntime>>>,
    registry: Arc<Registry>,
    notices: mpsc::Sender<UpstreamNotice>,
    identity: Implementation,
}

impl LifecycleManager {
    /// Manager wired to the registry it purges and the notice channel the
    /// hub consumes.
    pub fn new(registry: Arc<Registry>, notices: mpsc::Sender<UpstreamNotice>) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            registry,
            notices,
            identity: Implementation {
                name: "mcpmux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Register a configured server. Initial state is MANUAL for manual
    /// policy, INACTIVE otherwise.
    pub fn register_server(&self, config: ServerConfig) {
        let id = config.id.clone();
        let runtime = Arc::new(ServerRuntime::new(config));
        self.servers.write().insert(id, runtime);
    }

    /// Ids of every registered server.
    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.read().keys().cloned().collect()
    }

    /// Ids of servers with `always` activation policy.
    pub fn always_server_ids(&self) -> Vec<ServerId> {
        self.servers
            .read()
            .values()
            .filter(|runtime| runtime.config.activation == ActivationPolicy::Always)
            .map(|runtime| runtime.config.id.clone())
            .collect()
    }

    fn runtime(&self, id: &str) -> Option<Arc<ServerRuntime>> {
        self.servers.read().get(id).cloned()
    }

    /// Current state, when the server exists.
    pub fn state(&self, id: &str) -> Option<ServerState> {
        self.runtime(id).map(|runtime| runtime.state())
    }

    /// The live client for a routable server.
    pub fn client(&self, id: &str) -> Option<Arc<UpstreamClient>> {
        let runtime = self.runtime(id)?;
        if runtime.state().is_routable() {
            runtime.client()
        } else {
            None
        }
    }

    /// Activity snapshot, while the server runs.
    pub fn activity(&self, id: &str) -> Option<ActivityRecord> {
        self.runtime(id)?.activity.lock().clone()
    }

    /// Whether `source` may activate a server with `policy`.
    pub fn should_activate(policy: ActivationPolicy, source: ActivationSource) -> bool {
        match policy {
            ActivationPolicy::Always => true,
            ActivationPolicy::OnDemand => {
                matches!(source, ActivationSource::Route | ActivationSource::Manual)
            }
            ActivationPolicy::Manual => matches!(source, ActivationSource::Manual),
        }
    }

    /// Union of the feature records of every routable server.
    pub fn active_features(&self) -> FeatureSet {
        let runtimes: Vec<Arc<ServerRuntime>> =
            self.servers.read().values().cloned().collect();
        let mut features = FeatureSet::default();
        for runtime in runtimes {
            if runtime.state().is_routable()
                && let Some(client) = runtime.client()
                && let Some(negotiated) = client.negotiated()
            {
                features = features.union(negotiated.features);
            }
        }
        features
    }

    /// Bring a server up (or return the client already running). Concurrent
    /// callers for the same id serialize on the server's slot; all of them
    /// observe the single activation the first caller performed.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Policy` when `source` may not activate,
    /// `Transport`/`Protocol`/`Timeout` for connection failures, and
    /// `Transport` while the server cools down from an earlier failure.
    pub async fn activate(
        self: &Arc<Self>,
        id: &str,
        source: ActivationSource,
    ) -> Result<Arc<UpstreamClient>, HubError> {
        let runtime = self
            .runtime(id)
            .ok_or_else(|| HubError::NotFound(format!("unknown server: {id}")))?;

        if !Self::should_activate(runtime.config.activation, source) {
            return Err(HubError::Policy(format!(
                "server '{id}' (policy {:?}) cannot be activated by {source:?}",
                runtime.config.activation
            )));
        }

        // Fast path without the slot.
        if runtime.state().is_routable()
            && let Some(client) = runtime.client()
        {
            return Ok(client);
        }

        let _guard = runtime.slot.lock().await;

        // A concurrent activation may have completed while we waited.
        if runtime.state().is_routable()
            && let Some(client) = runtime.client()
        {
            return Ok(client);
        }

        match runtime.state() {
            ServerState::Error | ServerState::Cooldown => {
                let now = Instant::now();
                let until = *runtime.cooldown_until.lock();
                match until {
                    Some(until) if now < until => {
                        return Err(HubError::Transport(format!(
                            "server '{id}' is cooling down after a failure ({} ms left)",
                            until.duration_since(now).as_millis()
                        )));
                    }
                    _ => runtime.set_state(ServerState::Inactive),
                }
            }
            ServerState::Stopping => {
                // The slot serializes stop and start, so this is unreachable
                // in practice; treat it as inactive.
                runtime.set_state(ServerState::Inactive);
            }
            _ => {}
        }

        runtime.set_state(ServerState::Activating);
        info!(server = %id, source = ?source, "activating");

        match self.connect(&runtime).await {
            Ok(client) => {
                let now = Instant::now();
                *runtime.client.lock() = Some(Arc::clone(&client));
                *runtime.activity.lock() = Some(ActivityRecord::new(now));
                *runtime.cooldown_until.lock() = None;
                runtime.set_state(ServerState::Active);

                self.ingest_catalog(&runtime, &client).await;
                Ok(client)
            }
            Err(error) => {
                warn!(server = %id, %error, "activation failed");
                runtime.set_state(ServerState::Error);
                *runtime.cooldown_until.lock() = Some(
                    Instant::now()
                        + Duration::from_millis(runtime.config.timeouts.cooldown_ms),
                );
                Err(error)
            }
        }
    }

    async fn connect(
        self: &Arc<Self>,
        runtime: &Arc<ServerRuntime>,
    ) -> Result<Arc<UpstreamClient>, HubError> {
        let config = &runtime.config;
        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let spec = ChildSpawnSpec {
                    command: command.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    cwd: cwd.clone(),
                };
                Arc::new(
                    ChildProcessTransport::spawn(&spec, &config.id)
                        .map_err(|e| HubError::Transport(e.to_string()))?,
                )
            }
            TransportConfig::Http { url, headers } => Arc::new(
                StreamableHttpTransport::new(StreamableHttpConfig {
                    url: url.clone(),
                    headers: headers.clone(),
                })
                .map_err(|e| HubError::Transport(e.to_string()))?,
            ),
            TransportConfig::Sse { url, headers } => Arc::new(
                SseClientTransport::new(SseClientConfig {
                    url: url.clone(),
                    headers: headers.clone(),
                    ready_timeout: Duration::from_millis(config.timeouts.ready_ms),
                })
                .map_err(|e| HubError::Transport(e.to_string()))?,
            ),
        };

        let client_config = ClientConfig {
            server_id: config.id.clone(),
            client_info: self.identity.clone(),
            handshake_timeout: config.quirks.handshake_timeout(&config.timeouts),
            max_in_flight: mcpmux_client::DEFAULT_MAX_IN_FLIGHT,
            quirks: HandshakeQuirks {
                force_protocol_version: config.quirks.force_protocol_version.clone(),
                skip_negotiation: config.quirks.skip_negotiation,
                assumed_features: config.quirks.assumed_features(),
            },
        };

        let (events_tx, mut events_rx) = mpsc::channel(64);
        let client = UpstreamClient::connect(transport, client_config, events_tx)
            .await
            .map_err(HubError::from)?;

        // One pump per connection: notifications go to the hub's event loop,
        // a disconnect drives the state machine.
        let manager = Arc::clone(self);
        let server_id = config.id.clone();
        let pump_client = Arc::clone(&client);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    ClientEvent::Notification(notification) => {
                        let notice = UpstreamNotice {
                            server_id: server_id.clone(),
                            notification,
                        };
                        if manager.notices.send(notice).await.is_err() {
                            break;
                        }
                    }
                    ClientEvent::Disconnected { reason } => {
                        manager
                            .handle_disconnect(&server_id, &pump_client, reason)
                            .await;
                    }
                }
            }
        });

        Ok(client)
    }

    async fn ingest_catalog(&self, runtime: &Arc<ServerRuntime>, client: &Arc<UpstreamClient>) {
        match client.pull_catalog().await {
            Ok(catalog) => {
                let id = &runtime.config.id;
                self.registry.register_server_tools(id, &catalog.tools);
                self.registry
                    .register_server_resources(id, &catalog.resources);
                self.registry
                    .register_server_templates(id, &catalog.resource_templates);
                self.registry.register_server_prompts(id, &catalog.prompts);
            }
            Err(error) => {
                // The server stays up; a transport-level failure will arrive
                // as a disconnect event on its own.
                warn!(server = %runtime.config.id, %error, "catalog pull failed");
            }
        }
    }

    /// Re-pull and re-register a server's catalogs (upstream list-changed).
    pub async fn refresh_catalog(&self, id: &str) {
        let Some(runtime) = self.runtime(id) else {
            return;
        };
        let Some(client) = self.client(id) else {
            return;
        };
        self.registry.unregister_all(id);
        self.ingest_catalog(&runtime, &client).await;
    }

    async fn handle_disconnect(
        self: &Arc<Self>,
        id: &str,
        failed_client: &Arc<UpstreamClient>,
        reason: Option<String>,
    ) {
        let Some(runtime) = self.runtime(id) else {
            return;
        };
        let _guard = runtime.slot.lock().await;

        // A stale event from a previous incarnation must not kill the
        // current one.
        let is_current = runtime
            .client()
            .is_some_and(|current| Arc::ptr_eq(&current, failed_client));
        if !is_current {
            return;
        }

        warn!(
            server = %id,
            reason = reason.as_deref().unwrap_or("connection closed"),
            "upstream lost, entering cooldown"
        );
        self.registry.unregister_all(id);
        *runtime.client.lock() = None;
        *runtime.activity.lock() = None;
        runtime.set_state(ServerState::Error);
        *runtime.cooldown_until.lock() =
            Some(Instant::now() + Duration::from_millis(runtime.config.timeouts.cooldown_ms));
    }

    /// Stop a running server. No-op outside ACTIVE/IDLING.
    pub async fn deactivate(&self, id: &str, reason: &str) {
        let Some(runtime) = self.runtime(id) else {
            return;
        };
        let _guard = runtime.slot.lock().await;
        if !runtime.state().is_routable() {
            return;
        }

        info!(server = %id, %reason, "deactivating");
        runtime.set_state(ServerState::Stopping);
        self.registry.unregister_all(id);

        let client = runtime.client.lock().take();
        if let Some(client) = client {
            client.close().await;
        }
        if let Some(record) = runtime.activity.lock().take() {
            debug!(
                server = %id,
                total_calls = record.total_calls,
                tools = ?record.tool_calls,
                "activity at shutdown"
            );
        }
        runtime.set_state(ServerState::Inactive);
    }

    /// Begin tracking one forwarded call.
    pub fn track_activity_start(
        &self,
        id: &str,
        session_id: &str,
        tool: Option<&str>,
        now: Instant,
    ) {
        let Some(runtime) = self.runtime(id) else {
            return;
        };
        {
            let mut activity = runtime.activity.lock();
            let Some(record) = activity.as_mut() else {
                return;
            };
            record.reference_count += 1;
            record.total_calls += 1;
            record.active_sessions.insert(session_id.to_string());
            if let Some(tool) = tool {
                *record.tool_calls.entry(tool.to_string()).or_insert(0) += 1;
            }
            if runtime.config.idle.reset == IdleResetMode::OnCallStart {
                record.last_activity_at = now;
            }
        }
        if runtime.state() == ServerState::Idling {
            runtime.set_state(ServerState::Active);
        }
    }

    /// Finish tracking one forwarded call.
    pub fn track_activity_end(&self, id: &str, now: Instant) {
        let Some(runtime) = self.runtime(id) else {
            return;
        };
        let idle = {
            let mut activity = runtime.activity.lock();
            let Some(record) = activity.as_mut() else {
                return;
            };
            record.reference_count = record.reference_count.saturating_sub(1);
            if record.reference_count == 0 {
                if runtime.config.idle.reset == IdleResetMode::OnCallEnd {
                    record.last_activity_at = now;
                }
                true
            } else {
                false
            }
        };
        if idle && runtime.state() == ServerState::Active {
            runtime.set_state(ServerState::Idling);
        }
    }

    /// Periodic evaluation (every 10 s in production; tests drive it with
    /// explicit clocks): cooldown expiry and idle shutdown.
    pub async fn sweep(&self, now: Instant) {
        let runtimes: Vec<Arc<ServerRuntime>> =
            self.servers.read().values().cloned().collect();

        for runtime in runtimes {
            let id = runtime.config.id.clone();
            match runtime.state() {
                ServerState::Error => {
                    runtime.set_state(ServerState::Cooldown);
                }
                ServerState::Cooldown => {
                    let expired = runtime
                        .cooldown_until
                        .lock()
                        .is_none_or(|until| now >= until);
                    if expired {
                        *runtime.cooldown_until.lock() = None;
                        runtime.set_state(ServerState::Inactive);
                    }
                }
                ServerState::Active | ServerState::Idling => {
                    if runtime.config.activation == ActivationPolicy::Always {
                        continue;
                    }
                    let should_stop = {
                        let activity = runtime.activity.lock();
                        activity.as_ref().is_some_and(|record| {
                            record.reference_count == 0
                                && now.duration_since(record.started_at)
                                    >= runtime.config.idle.min_linger()
                                && now.duration_since(record.last_activity_at)
                                    >= runtime.config.idle.idle_timeout()
                        })
                    };
                    if should_stop {
                        self.deactivate(&id, "idle timeout").await;
                    }
                }
                _ => {}
            }
        }
    }

    /// Stop everything (hub shutdown).
    pub async fn shutdown_all(&self) {
        for id in self.server_ids() {
            self.deactivate(&id, "hub shutdown").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IdlePolicy, QuirksConfig, TimeoutsConfig};
    use pretty_assertions::assert_eq;

    fn stdio_config(id: &str, policy: ActivationPolicy) -> ServerConfig {
        ServerConfig {
            id: id.to_string(),
            transport: TransportConfig::Stdio {
                command: "true".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                cwd: None,
            },
            activation: policy,
            idle: IdlePolicy {
                idle_timeout_ms: 100,
                min_linger_ms: 50,
                reset: IdleResetMode::OnCallEnd,
            },
            timeouts: TimeoutsConfig::default(),
            quirks: QuirksConfig::default(),
        }
    }

    fn manager() -> (Arc<LifecycleManager>, mpsc::Receiver<UpstreamNotice>) {
        let (registry_tx, _registry_rx) = mpsc::channel(64);
        let registry = Arc::new(Registry::new(registry_tx));
        // Keep the registry event receiver alive for the test duration.
        std::mem::forget(_registry_rx);
        let (notices_tx, notices_rx) = mpsc::channel(64);
        (
            Arc::new(LifecycleManager::new(registry, notices_tx)),
            notices_rx,
        )
    }

    #[test]
    fn initial_state_follows_policy() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("a", ActivationPolicy::Manual));
        manager.register_server(stdio_config("b", ActivationPolicy::OnDemand));
        manager.register_server(stdio_config("c", ActivationPolicy::Always));
        assert_eq!(manager.state("a"), Some(ServerState::Manual));
        assert_eq!(manager.state("b"), Some(ServerState::Inactive));
        assert_eq!(manager.state("c"), Some(ServerState::Inactive));
        assert_eq!(manager.state("missing"), None);
    }

    #[test]
    fn policy_gating() {
        use ActivationPolicy as P;
        use ActivationSource as S;
        assert!(LifecycleManager::should_activate(P::Always, S::Startup));
        assert!(LifecycleManager::should_activate(P::Always, S::Route));
        assert!(!LifecycleManager::should_activate(P::OnDemand, S::Startup));
        assert!(LifecycleManager::should_activate(P::OnDemand, S::Route));
        assert!(LifecycleManager::should_activate(P::OnDemand, S::Manual));
        assert!(!LifecycleManager::should_activate(P::Manual, S::Route));
        assert!(!LifecycleManager::should_activate(P::Manual, S::Startup));
        assert!(LifecycleManager::should_activate(P::Manual, S::Manual));
    }

    #[tokio::test]
    async fn manual_server_rejects_routed_activation() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("m", ActivationPolicy::Manual));
        let result = manager.activate("m", ActivationSource::Route).await;
        assert!(matches!(result, Err(HubError::Policy(_))));
        // MANUAL does not auto-transition out of itself.
        assert_eq!(manager.state("m"), Some(ServerState::Manual));
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let (manager, _rx) = manager();
        let result = manager.activate("ghost", ActivationSource::Manual).await;
        assert!(matches!(result, Err(HubError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_activation_enters_error_then_cooldown_then_inactive() {
        let (manager, _rx) = manager();
        let mut config = stdio_config("s", ActivationPolicy::OnDemand);
        config.transport = TransportConfig::Stdio {
            command: "/nonexistent/mcpmux-test-binary".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        };
        config.timeouts.cooldown_ms = 0;
        manager.register_server(config);

        let result = manager.activate("s", ActivationSource::Route).await;
        assert!(result.is_err());
        assert_eq!(manager.state("s"), Some(ServerState::Error));

        // First sweep: ERROR -> COOLDOWN. Second: cooldown elapsed -> INACTIVE.
        manager.sweep(Instant::now()).await;
        assert_eq!(manager.state("s"), Some(ServerState::Cooldown));
        manager.sweep(Instant::now()).await;
        assert_eq!(manager.state("s"), Some(ServerState::Inactive));
    }

    #[tokio::test]
    async fn activation_during_cooldown_is_rejected() {
        let (manager, _rx) = manager();
        let mut config = stdio_config("s", ActivationPolicy::OnDemand);
        config.transport = TransportConfig::Stdio {
            command: "/nonexistent/mcpmux-test-binary".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        };
        config.timeouts.cooldown_ms = 60_000;
        manager.register_server(config);

        let _ = manager.activate("s", ActivationSource::Route).await;
        let retry = manager.activate("s", ActivationSource::Route).await;
        match retry {
            Err(HubError::Transport(message)) => assert!(message.contains("cooling down")),
            other => panic!("expected cooldown rejection, got {other:?}"),
        }
    }

    // Idle-engine tests drive the bookkeeping directly on a runtime forced
    // into ACTIVE, without a live upstream.
    fn force_active(manager: &LifecycleManager, id: &str, now: Instant) {
        let runtime = manager.runtime(id).unwrap();
        runtime.set_state(ServerState::Active);
        *runtime.activity.lock() = Some(ActivityRecord::new(now));
    }

    #[tokio::test]
    async fn reference_counting_drives_idle_transitions() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("s", ActivationPolicy::OnDemand));
        let t0 = Instant::now();
        force_active(&manager, "s", t0);

        manager.track_activity_start("s", "sess-1", Some("read_file"), t0);
        manager.track_activity_start("s", "sess-2", Some("read_file"), t0);
        let record = manager.activity("s").unwrap();
        assert_eq!(record.reference_count, 2);
        assert_eq!(record.total_calls, 2);
        assert_eq!(record.tool_calls["read_file"], 2);
        assert_eq!(record.active_sessions.len(), 2);
        assert_eq!(manager.state("s"), Some(ServerState::Active));

        manager.track_activity_end("s", t0 + Duration::from_millis(10));
        assert_eq!(manager.state("s"), Some(ServerState::Active));
        manager.track_activity_end("s", t0 + Duration::from_millis(20));
        assert_eq!(manager.state("s"), Some(ServerState::Idling));
        assert_eq!(manager.activity("s").unwrap().reference_count, 0);

        // New activity revives the server.
        manager.track_activity_start("s", "sess-1", None, t0 + Duration::from_millis(30));
        assert_eq!(manager.state("s"), Some(ServerState::Active));
    }

    #[tokio::test]
    async fn reference_count_never_goes_negative() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("s", ActivationPolicy::OnDemand));
        let t0 = Instant::now();
        force_active(&manager, "s", t0);
        manager.track_activity_end("s", t0);
        assert_eq!(manager.activity("s").unwrap().reference_count, 0);
    }

    #[tokio::test]
    async fn idle_sweep_honors_linger_then_stops() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("s", ActivationPolicy::OnDemand));
        let t0 = Instant::now();
        force_active(&manager, "s", t0);
        // One call completes immediately: idle clock starts at t0.
        manager.track_activity_start("s", "sess", Some("t"), t0);
        manager.track_activity_end("s", t0);

        // t=60ms: linger (50ms) met, idle (100ms) not yet.
        manager.sweep(t0 + Duration::from_millis(60)).await;
        assert_eq!(manager.state("s"), Some(ServerState::Idling));

        // t=120ms: both met; the server stops.
        manager.sweep(t0 + Duration::from_millis(120)).await;
        assert_eq!(manager.state("s"), Some(ServerState::Inactive));
        assert!(manager.activity("s").is_none());
    }

    #[tokio::test]
    async fn always_servers_never_idle_stop() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("s", ActivationPolicy::Always));
        let t0 = Instant::now();
        force_active(&manager, "s", t0);
        manager.track_activity_start("s", "sess", None, t0);
        manager.track_activity_end("s", t0);

        manager.sweep(t0 + Duration::from_secs(3600)).await;
        assert_eq!(manager.state("s"), Some(ServerState::Idling));
    }

    #[tokio::test]
    async fn busy_server_is_not_idle_stopped() {
        let (manager, _rx) = manager();
        manager.register_server(stdio_config("s", ActivationPolicy::OnDemand));
        let t0 = Instant::now();
        force_active(&manager, "s", t0);
        manager.track_activity_start("s", "sess", None, t0);

        manager.sweep(t0 + Duration::from_secs(3600)).await;
        assert_eq!(manager.state("s"), Some(ServerState::Active));
    }
}
