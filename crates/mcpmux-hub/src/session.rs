//! Downstream session store.
//!
//! Sessions are created lazily on the first request presenting a new id,
//! touched on every later request, and reaped by a periodic sweep once their
//! TTL lapses. Every operation takes `now` explicitly so tests never sleep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// One downstream client's session record.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id (client-supplied or hub-generated).
    pub id: String,
    /// When the session was created.
    pub created_at: Instant,
    /// Last time a request touched it.
    pub last_accessed_at: Instant,
    /// Time-to-live measured from `last_accessed_at`.
    pub ttl: Duration,
    /// Protocol version recorded by this session's `initialize`.
    pub protocol_version: Option<String>,
}

impl Session {
    /// A session is expired iff `now > last_accessed_at + ttl`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.last_accessed_at + self.ttl
    }
}

/// TTL-bounded session table.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    default_ttl: Duration,
}

impl SessionStore {
    /// Store with the given default TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Create the session if absent, touch it if alive, replace it if the
    /// record already expired. Returns true when a new record was created
    /// (including the replace case).
    pub fn create_or_touch(&self, id: &str, now: Instant) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(session) if !session.is_expired(now) => {
                session.last_accessed_at = now;
                false
            }
            _ => {
                sessions.insert(
                    id.to_string(),
                    Session {
                        id: id.to_string(),
                        created_at: now,
                        last_accessed_at: now,
                        ttl: self.default_ttl,
                        protocol_version: None,
                    },
                );
                debug!(session = %id, "session created");
                true
            }
        }
    }

    /// Snapshot of one session.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    /// Record the protocol version negotiated by this session.
    pub fn set_protocol_version(&self, id: &str, version: &str) {
        if let Some(session) = self.sessions.lock().get_mut(id) {
            session.protocol_version = Some(version.to_string());
        }
    }

    /// Remove a session. Returns true when it existed.
    pub fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.lock().remove(id).is_some();
        if removed {
            debug!(session = %id, "session deleted");
        }
        removed
    }

    /// Drop every expired session, returning their ids so the caller can
    /// clean up dependent state (fan-out sinks, pending requests).
    pub fn sweep_expired(&self, now: Instant) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<String> = sessions
            .values()
            .filter(|session| session.is_expired(now))
            .map(|session| session.id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
            debug!(session = %id, "session expired");
        }
        expired
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// True when no session exists.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Ids of all live sessions.
    pub fn ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }
}
