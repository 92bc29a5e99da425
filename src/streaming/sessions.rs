//! Stream session tracking.
//!
//! Every `/media` and `/play` response runs inside a session. The handler
//! owns the session through a [`SessionGuard`]; the registry only keeps a
//! snapshot for `/status` and the cancellation token so other components
//! (a range cache switching URLs, shutdown) can stop it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Which component serves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    RangeCache,
    Parallel,
    Passthrough,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Fetching,
    RangeResolved,
    Streaming,
    Closed,
}

/// Read-only view of a streaming session.
#[derive(Debug, Clone, Serialize)]
pub struct StreamSession {
    /// Unique session identifier (UUID).
    pub id: String,
    pub kind: SessionKind,
    /// Origin URL being streamed.
    pub url: String,
    /// SHA-256 of the URL; names the range cache directory.
    #[serde(skip)]
    pub url_key: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

struct Entry {
    session: StreamSession,
    cancel: CancellationToken,
}

/// Thread-safe registry of active sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Entry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return the guard that owns it.
    pub fn register(&self, kind: SessionKind, url: &str, url_key: &str) -> SessionGuard {
        let id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        let session = StreamSession {
            id: id.clone(),
            kind,
            url: url.to_string(),
            url_key: url_key.to_string(),
            state: SessionState::Created,
            started_at: Utc::now(),
        };
        self.sessions.insert(
            id.clone(),
            Entry {
                session,
                cancel: cancel.clone(),
            },
        );
        tracing::info!(session_id = %id, kind = ?kind, url = %url, "Registered stream session");

        SessionGuard {
            registry: self.clone(),
            id,
            cancel,
        }
    }

    fn set_state(&self, id: &str, state: SessionState) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.session.state = state;
        }
    }

    /// Remove a session from the registry.
    pub fn end(&self, id: &str) {
        if let Some((_, entry)) = self.sessions.remove(id) {
            tracing::info!(
                session_id = %id,
                kind = ?entry.session.kind,
                cancelled = entry.cancel.is_cancelled(),
                duration_secs = (Utc::now() - entry.session.started_at).num_seconds(),
                "Ended stream session"
            );
        }
    }

    /// Cancel every session matching `predicate`. Returns how many were cancelled.
    pub fn cancel_where(&self, predicate: impl Fn(&StreamSession) -> bool) -> usize {
        let mut cancelled = 0;
        for entry in self.sessions.iter() {
            if predicate(&entry.session) && !entry.cancel.is_cancelled() {
                tracing::debug!(session_id = %entry.session.id, "Cancelling stream session");
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Cancel all sessions (shutdown).
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    pub fn list(&self) -> Vec<StreamSession> {
        self.sessions
            .iter()
            .map(|entry| entry.session.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<StreamSession> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    /// Drop entries that were cancelled more than `grace` ago but never ended.
    ///
    /// Guards normally remove their own entry; this only catches sessions
    /// whose owner task was aborted before its guard ran.
    pub fn cleanup_stale(&self, grace: Duration) -> usize {
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let mut removed = 0;
        self.sessions.retain(|id, entry| {
            let stale = entry.cancel.is_cancelled() && now - entry.session.started_at > grace;
            if stale {
                tracing::info!(session_id = %id, "Removed stale stream session");
                removed += 1;
            }
            !stale
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Owning handle of one session. Dropping it cancels the session and
/// removes it from the registry.
pub struct SessionGuard {
    registry: SessionRegistry,
    id: String,
    cancel: CancellationToken,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_state(&self, state: SessionState) {
        self.registry.set_state(&self.id, state);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.registry.set_state(&self.id, SessionState::Closed);
        self.registry.end(&self.id);
    }
}

/// Start a background task that periodically removes stale sessions.
pub fn start_cleanup_task(registry: SessionRegistry, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            registry.cleanup_stale(Duration::from_secs(interval_secs.max(1)));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_drop() {
        let registry = SessionRegistry::new();
        let guard = registry.register(SessionKind::Parallel, "http://o/v.mp4", "k1");
        assert_eq!(registry.len(), 1);

        let session = registry.get(guard.id()).unwrap();
        assert_eq!(session.kind, SessionKind::Parallel);
        assert_eq!(session.state, SessionState::Created);

        guard.set_state(SessionState::Streaming);
        assert_eq!(registry.get(guard.id()).unwrap().state, SessionState::Streaming);

        let token = guard.token().clone();
        drop(guard);
        assert!(registry.is_empty());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_where() {
        let registry = SessionRegistry::new();
        let a = registry.register(SessionKind::RangeCache, "http://o/a", "ka");
        let b = registry.register(SessionKind::RangeCache, "http://o/b", "kb");

        let cancelled = registry.cancel_where(|s| s.url_key != "kb");
        assert_eq!(cancelled, 1);
        assert!(a.token().is_cancelled());
        assert!(!b.token().is_cancelled());
        // Cancelling does not unregister; the owner does.
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_cleanup_stale() {
        let registry = SessionRegistry::new();
        let guard = registry.register(SessionKind::Passthrough, "http://o/a", "ka");
        guard.token().cancel();
        std::mem::forget(guard);

        assert_eq!(registry.cleanup_stale(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.cleanup_stale(Duration::from_millis(1)), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_sessions() {
        let registry = SessionRegistry::new();
        let _a = registry.register(SessionKind::Parallel, "http://o/a", "ka");
        let _b = registry.register(SessionKind::Parallel, "http://o/b", "kb");
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.cancel_all(), 2);
    }
}
