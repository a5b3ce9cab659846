//! SSE fan-out manager.
//!
//! Tracks one outbound event sink per downstream client and the mapping from
//! progress tokens back to the client whose call registered them. Delivery is
//! best-effort: a sink whose bounded queue stays full past the stall grace is
//! evicted together with its progress tokens, and one dead client never fails
//! another.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use mcpmux_protocol::ProgressToken;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SINK_QUEUE_CAPACITY: usize = 256;
const STALL_GRACE: Duration = Duration::from_secs(5);

/// One outbound frame. `event` picks the SSE event name; `None` means a
/// plain `data:` frame. Stdio sessions ignore the name and write `data`
/// as a protocol frame directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// SSE event name.
    pub event: Option<String>,
    /// JSON payload (a complete JSON-RPC message).
    pub data: Value,
}

impl OutboundFrame {
    /// A `progress`-named frame.
    pub fn progress(data: Value) -> Self {
        Self {
            event: Some("progress".to_string()),
            data,
        }
    }

    /// A plain data frame.
    pub fn message(data: Value) -> Self {
        Self { event: None, data }
    }
}

struct ClientSink {
    tx: mpsc::Sender<OutboundFrame>,
    stalled_since: Option<Instant>,
}

#[derive(Default)]
struct FanoutState {
    clients: HashMap<String, ClientSink>,
    tokens: HashMap<ProgressToken, String>,
}

/// Fan-out table: `client id → sink`, `progress token → client id`.
pub struct FanoutManager {
    state: Mutex<FanoutState>,
}

impl Default for FanoutManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FanoutManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FanoutState::default()),
        }
    }

    /// Register (or replace) a client's sink, returning the receive side the
    /// endpoint drains into its stream.
    pub fn register_client(&self, client_id: &str) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_CAPACITY);
        let mut state = self.state.lock();
        state.clients.insert(
            client_id.to_string(),
            ClientSink {
                tx,
                stalled_since: None,
            },
        );
        debug!(client = %client_id, "fan-out sink registered");
        rx
    }

    /// Drop a client's sink and every progress token routed to it.
    pub fn unregister_client(&self, client_id: &str) {
        let mut state = self.state.lock();
        state.clients.remove(client_id);
        state.tokens.retain(|_, owner| owner != client_id);
        debug!(client = %client_id, "fan-out sink unregistered");
    }

    /// Route a progress token to a client. Last writer wins on collisions.
    pub fn register_token(&self, token: ProgressToken, client_id: &str) {
        self.state
            .lock()
            .tokens
            .insert(token, client_id.to_string());
    }

    /// Which client a token routes to.
    pub fn client_for_token(&self, token: &ProgressToken) -> Option<String> {
        self.state.lock().tokens.get(token).cloned()
    }

    /// Deliver a progress frame to the client owning `token`. Returns true
    /// when the token routed somewhere.
    pub fn route_progress(&self, token: &ProgressToken, data: Value, now: Instant) -> bool {
        let client_id = {
            let state = self.state.lock();
            state.tokens.get(token).cloned()
        };
        match client_id {
            Some(client_id) => {
                self.send_to(&client_id, OutboundFrame::progress(data), now);
                true
            }
            None => {
                debug!(%token, "progress for unrouted token dropped");
                false
            }
        }
    }

    /// Deliver a frame to one client, best-effort. Returns false when the
    /// client is unknown or was evicted by this delivery.
    pub fn send_to(&self, client_id: &str, frame: OutboundFrame, now: Instant) -> bool {
        let mut state = self.state.lock();
        let Some(sink) = state.clients.get_mut(client_id) else {
            return false;
        };
        match sink.tx.try_send(frame) {
            Ok(()) => {
                sink.stalled_since = None;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let since = *sink.stalled_since.get_or_insert(now);
                if now.duration_since(since) > STALL_GRACE {
                    warn!(client = %client_id, "evicting stalled fan-out sink");
                    state.clients.remove(client_id);
                    state.tokens.retain(|_, owner| owner != client_id);
                    false
                } else {
                    // Within the grace: the frame is dropped, the sink stays.
                    true
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(client = %client_id, "fan-out sink closed, evicting");
                state.clients.remove(client_id);
                state.tokens.retain(|_, owner| owner != client_id);
                false
            }
        }
    }

    /// Deliver a frame to every connected client, best-effort.
    pub fn broadcast(&self, frame: &OutboundFrame, now: Instant) {
        let client_ids: Vec<String> = {
            let state = self.state.lock();
            state.clients.keys().cloned().collect()
        };
        for client_id in client_ids {
            self.send_to(&client_id, frame.clone(), now);
        }
    }

    /// Number of connected sinks.
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn progress_routes_only_to_the_registering_client() {
        let fanout = FanoutManager::new();
        let mut rx1 = fanout.register_client("c1");
        let mut rx2 = fanout.register_client("c2");
        fanout.register_token(ProgressToken::from("p1"), "c1");

        let now = Instant::now();
        assert!(fanout.route_progress(&ProgressToken::from("p1"), json!({"progress": 50}), now));

        let frame = rx1.try_recv().unwrap();
        assert_eq!(frame.event.as_deref(), Some("progress"));
        assert_eq!(frame.data, json!({"progress": 50}));
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn unrouted_token_is_dropped() {
        let fanout = FanoutManager::new();
        let _rx = fanout.register_client("c1");
        assert!(!fanout.route_progress(&ProgressToken::from("nope"), json!({}), Instant::now()));
    }

    #[test]
    fn token_collision_is_last_writer_wins() {
        let fanout = FanoutManager::new();
        let mut rx1 = fanout.register_client("c1");
        let mut rx2 = fanout.register_client("c2");
        fanout.register_token(ProgressToken::from("p"), "c1");
        fanout.register_token(ProgressToken::from("p"), "c2");

        fanout.route_progress(&ProgressToken::from("p"), json!(1), Instant::now());
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn closed_sink_is_evicted_with_its_tokens() {
        let fanout = FanoutManager::new();
        let rx = fanout.register_client("c1");
        fanout.register_token(ProgressToken::from("p"), "c1");
        drop(rx);

        assert!(!fanout.send_to("c1", OutboundFrame::message(json!({})), Instant::now()));
        assert_eq!(fanout.client_count(), 0);
        assert_eq!(fanout.client_for_token(&ProgressToken::from("p")), None);
    }

    #[test]
    fn stalled_sink_survives_within_grace_then_dies() {
        let fanout = FanoutManager::new();
        let _rx = fanout.register_client("c1");

        let t0 = Instant::now();
        // Fill the bounded queue.
        for _ in 0..SINK_QUEUE_CAPACITY {
            assert!(fanout.send_to("c1", OutboundFrame::message(json!(1)), t0));
        }
        // Queue full, within the grace: frame dropped, client kept.
        assert!(fanout.send_to("c1", OutboundFrame::message(json!(2)), t0));
        assert_eq!(fanout.client_count(), 1);

        // Still full past the grace: evicted.
        let late = t0 + STALL_GRACE + Duration::from_secs(1);
        assert!(!fanout.send_to("c1", OutboundFrame::message(json!(3)), late));
        assert_eq!(fanout.client_count(), 0);
    }

    #[test]
    fn broadcast_reaches_all_live_clients() {
        let fanout = FanoutManager::new();
        let mut rx1 = fanout.register_client("c1");
        let mut rx2 = fanout.register_client("c2");
        let dead = fanout.register_client("c3");
        drop(dead);

        fanout.broadcast(&OutboundFrame::message(json!({"m": 1})), Instant::now());
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert_eq!(fanout.client_count(), 2);
    }

    #[test]
    fn unregister_client_drops_tokens() {
        let fanout = FanoutManager::new();
        let _rx = fanout.register_client("c1");
        fanout.register_token(ProgressToken::from("p"), "c1");
        fanout.unregister_client("c1");
        assert_eq!(fanout.client_for_token(&ProgressToken::from("p")), None);
    }
}
