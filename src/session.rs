//! Streamable-HTTP session tracking. A session is a lightweight correlation
//! context keyed by `Mcp-Session-Id` — it carries no policy state of its own
//! (that all lives on the `KeyRecord`); it exists purely so a client's SSE
//! stream and its JSON-RPC POSTs can find each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub api_key_masked: String,
    pub sse_connections: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

struct Session {
    api_key: String,
    sse_connections: AtomicU32,
    created_at: DateTime<Utc>,
    last_activity_at: Mutex<DateTime<Utc>>,
    notifications: broadcast::Sender<String>,
}

impl Session {
    fn new(api_key: String) -> Self {
        let (tx, _rx) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let now = Utc::now();
        Self {
            api_key,
            sse_connections: AtomicU32::new(0),
            created_at: now,
            last_activity_at: Mutex::new(now),
            notifications: tx,
        }
    }

    fn touch(&self) {
        *self.last_activity_at.lock().unwrap() = Utc::now();
    }

    fn view(&self, session_id: &str) -> SessionView {
        SessionView {
            session_id: session_id.to_string(),
            api_key_masked: crate::keystore::mask_key(&self.api_key),
            sse_connections: self.sse_connections.load(Ordering::Acquire),
            created_at: self.created_at,
            last_activity_at: *self.last_activity_at.lock().unwrap(),
        }
    }
}

/// Owns every active session. TTL-evicted by a periodic sweep; the HTTP
/// layer is the sole owner per the spec's ownership rule.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Creates a session for a POST /mcp with no `Mcp-Session-Id` header.
    pub fn create(&self, api_key: String) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.lock().unwrap().insert(id.clone(), Session::new(api_key));
        id
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(s) = self.sessions.lock().unwrap().get(session_id) {
            s.touch();
        }
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }

    pub fn destroy(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().remove(session_id).is_some()
    }

    /// Registers a new SSE connection and returns a receiver for
    /// server-to-client notifications plus a guard that releases the slot
    /// on drop (covers both clean close and abrupt disconnect). Takes
    /// `self` behind an `Arc` so the guard can outlive the borrow that
    /// created it.
    pub fn subscribe(
        self: &Arc<Self>,
        session_id: &str,
    ) -> Option<(broadcast::Receiver<String>, SseGuard)> {
        let rx = {
            let sessions = self.sessions.lock().unwrap();
            let session = sessions.get(session_id)?;
            session.sse_connections.fetch_add(1, Ordering::AcqRel);
            session.notifications.subscribe()
        };
        Some((
            rx,
            SseGuard {
                manager: self.clone(),
                session_id: session_id.to_string(),
            },
        ))
    }

    fn release_sse_slot(&self, session_id: &str) {
        if let Some(s) = self.sessions.lock().unwrap().get(session_id) {
            s.sse_connections.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Sends a notification to every SSE stream on this session. No-op if
    /// the session doesn't exist or has no active listeners.
    pub fn notify(&self, session_id: &str, payload: String) {
        if let Some(s) = self.sessions.lock().unwrap().get(session_id) {
            let _ = s.notifications.send(payload);
        }
    }

    pub fn view(&self, session_id: &str) -> Option<SessionView> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.view(session_id))
    }

    /// Evicts sessions idle longer than the configured TTL.
    pub fn sweep(&self) {
        let ttl = self.ttl;
        let now = Utc::now();
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| {
            let idle = now.signed_duration_since(*s.last_activity_at.lock().unwrap());
            idle.to_std().map(|d| d < ttl).unwrap_or(true)
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, "session sweep evicted idle sessions");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases an SSE connection slot when the stream ends, however it ends
/// (clean close or abrupt disconnect).
pub struct SseGuard {
    manager: Arc<SessionManager>,
    session_id: String,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.manager.release_sse_slot(&self.session_id);
    }
}

pub fn spawn_sweep_task(manager: Arc<SessionManager>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.sweep();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_destroy_round_trips() {
        let mgr = SessionManager::new(Duration::from_secs(60));
        let id = mgr.create("pg_test".into());
        assert!(mgr.exists(&id));
        assert!(mgr.destroy(&id));
        assert!(!mgr.exists(&id));
    }

    #[test]
    fn subscribe_increments_and_guard_drop_decrements() {
        let mgr = std::sync::Arc::new(SessionManager::new(Duration::from_secs(60)));
        let id = mgr.create("pg_test".into());
        {
            let (_rx, _guard) = mgr.subscribe(&id).unwrap();
            assert_eq!(mgr.view(&id).unwrap().sse_connections, 1);
        }
        assert_eq!(mgr.view(&id).unwrap().sse_connections, 0);
    }

    #[test]
    fn sweep_evicts_only_past_ttl() {
        let mgr = SessionManager::new(Duration::from_millis(0));
        let id = mgr.create("pg_test".into());
        std::thread::sleep(Duration::from_millis(5));
        mgr.sweep();
        assert!(!mgr.exists(&id));
    }
}
