//! The hub facade.
//!
//! Owns construction wiring (channels in, no back-references), startup
//! ordering (register everything, activate `always` servers in parallel,
//! catalogs pulled as each comes up), the background loops, and the graceful
//! shutdown sequence: stop accepting → drain within the grace → cancel the
//! rest → close upstream clients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use mcpmux_protocol::{JsonRpcNotification, ProgressToken, methods};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HubConfig, HubSettings};
use crate::fanout::{FanoutManager, OutboundFrame};
use crate::lifecycle::{ActivationSource, LifecycleManager, UpstreamNotice};
use crate::registry::{ListChanged, Registry};
use crate::router::Router;
use crate::session::SessionStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const LIFECYCLE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The assembled hub.
pub struct Hub {
    settings: HubSettings,
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleManager>,
    sessions: Arc<SessionStore>,
    fanout: Arc<FanoutManager>,
    router: Arc<Router>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Hub {
    /// Wire every component and register the configured servers. Nothing is
    /// connected yet; [`Hub::start`] brings up the `always` servers.
    pub fn new(config: HubConfig) -> Arc<Self> {
        let HubConfig { settings, servers } = config;

        let (registry_events_tx, registry_events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let registry = Arc::new(Registry::new(registry_events_tx));
        let (notices_tx, notices_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&registry), notices_tx));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(
            settings.session_ttl_seconds,
        )));
        let fanout = Arc::new(FanoutManager::new());
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&lifecycle),
            Arc::clone(&sessions),
            Arc::clone(&fanout),
            settings.clone(),
        ));

        for server in servers {
            lifecycle.register_server(server);
        }

        let hub = Arc::new(Self {
            settings,
            registry,
            lifecycle,
            sessions,
            fanout,
            router,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        hub.spawn_background(registry_events_rx, notices_rx);
        hub
    }

    /// The shared router.
    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    /// The session store.
    pub fn sessions(&self) -> Arc<SessionStore> {
        Arc::clone(&self.sessions)
    }

    /// The SSE fan-out.
    pub fn fanout(&self) -> Arc<FanoutManager> {
        Arc::clone(&self.fanout)
    }

    /// The lifecycle manager.
    pub fn lifecycle(&self) -> Arc<LifecycleManager> {
        Arc::clone(&self.lifecycle)
    }

    /// The capability registry.
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Hub-wide settings.
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Token cancelled when the hub shuts down; endpoints tie their
    /// accept loops to it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Activate every `always` server in parallel. Individual failures are
    /// logged and leave the server in its cooldown cycle; the hub runs on.
    pub async fn start(self: &Arc<Self>) {
        let ids = self.lifecycle.always_server_ids();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "activating always-on servers");
        let activations = ids.into_iter().map(|id| {
            let lifecycle = Arc::clone(&self.lifecycle);
            async move {
                if let Err(error) = lifecycle.activate(&id, ActivationSource::Startup).await {
                    warn!(server = %id, %error, "startup activation failed");
                }
            }
        });
        futures::future::join_all(activations).await;
    }

    /// Graceful shutdown: no new requests, drain within the grace period,
    /// cancel the rest, stop every upstream, stop the background loops.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("hub shutting down");
        self.router.begin_shutdown();

        let grace_deadline = Instant::now() + self.settings.shutdown_grace();
        while self.router.in_flight() > 0 && Instant::now() < grace_deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let remaining = self.router.in_flight();
        if remaining > 0 {
            warn!(remaining, "grace period elapsed, cancelling in-flight requests");
        }
        self.router.cancel_all_sessions();

        self.lifecycle.shutdown_all().await;
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("hub stopped");
    }

    fn spawn_background(
        self: &Arc<Self>,
        mut registry_events: mpsc::Receiver<ListChanged>,
        mut notices: mpsc::Receiver<UpstreamNotice>,
    ) {
        let mut tasks = self.tasks.lock();

        // Registry mutations fan out as MCP list-changed notifications to
        // every connected session, after the mutation that caused them.
        let fanout = Arc::clone(&self.fanout);
        tasks.push(tokio::spawn(async move {
            while let Some(event) = registry_events.recv().await {
                let method = match event {
                    ListChanged::Tools => methods::TOOLS_LIST_CHANGED,
                    ListChanged::Resources => methods::RESOURCES_LIST_CHANGED,
                    ListChanged::Prompts => methods::PROMPTS_LIST_CHANGED,
                };
                let notification = JsonRpcNotification::new(method, None);
                match serde_json::to_value(&notification) {
                    Ok(data) => {
                        fanout.broadcast(&OutboundFrame::message(data), Instant::now());
                    }
                    Err(error) => warn!(%error, "list-changed serialization failed"),
                }
            }
        }));

        // Upstream notifications: progress routes by token, list-changed
        // triggers a catalog refresh, the rest is logged and dropped.
        let hub = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            while let Some(notice) = notices.recv().await {
                hub.handle_upstream_notice(notice).await;
            }
        }));

        // Periodic lifecycle sweep: cooldown expiry and idle shutdown.
        let lifecycle = Arc::clone(&self.lifecycle);
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIFECYCLE_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => lifecycle.sweep(Instant::now()).await,
                    _ = shutdown.cancelled() => break,
                }
            }
        }));

        // Periodic session sweep: expired sessions lose their sinks and
        // their pending requests.
        let sessions = Arc::clone(&self.sessions);
        let fanout = Arc::clone(&self.fanout);
        let router = Arc::clone(&self.router);
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for session_id in sessions.sweep_expired(Instant::now()) {
                            fanout.unregister_client(&session_id);
                            router.cancel_session(&session_id);
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        }));
    }

    async fn handle_upstream_notice(&self, notice: UpstreamNotice) {
        let UpstreamNotice {
            server_id,
            notification,
        } = notice;
        match notification.method.as_str() {
            methods::PROGRESS => {
                let token = notification
                    .params
                    .as_ref()
                    .and_then(|params| params.get("progressToken"))
                    .and_then(|token| {
                        serde_json::from_value::<ProgressToken>(token.clone()).ok()
                    });
                let Some(token) = token else {
                    debug!(server = %server_id, "progress notification without a token");
                    return;
                };
                self.router.notify_progress(&token);
                match serde_json::to_value(&notification) {
                    Ok(data) => {
                        self.fanout.route_progress(&token, data, Instant::now());
                    }
                    Err(error) => warn!(%error, "progress serialization failed"),
                }
            }
            methods::TOOLS_LIST_CHANGED
            | methods::RESOURCES_LIST_CHANGED
            | methods::PROMPTS_LIST_CHANGED => {
                debug!(server = %server_id, method = %notification.method, "catalog refresh");
                self.lifecycle.refresh_catalog(&server_id).await;
            }
            other => {
                debug!(server = %server_id, method = %other, "unhandled upstream notification");
            }
        }
    }
}
