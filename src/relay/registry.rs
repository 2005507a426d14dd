//! Bookkeeping of live relay sessions.
//!
//! The registry never touches a session's frames; it only records which
//! sessions exist, what kind they are and which state they are in, for the
//! session cap and the diagnostics endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use uuid::Uuid;

use super::session::SessionState;
use super::RelayKind;

struct SessionEntry {
    kind: RelayKind,
    started_at: DateTime<Utc>,
    state: watch::Receiver<SessionState>,
}

/// One row of the session list.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub kind: RelayKind,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Aggregate view used by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub by_kind: HashMap<RelayKind, usize>,
    pub by_state: HashMap<SessionState, usize>,
}

/// Live sessions keyed by id.
///
/// ## Thread Safety:
/// The lock is never held across an `.await`.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    max_concurrent_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Register a session, refusing it when the cap is reached.
    pub fn try_register(
        &self,
        id: Uuid,
        kind: RelayKind,
        started_at: DateTime<Utc>,
        state: watch::Receiver<SessionState>,
    ) -> Result<(), String> {
        let mut sessions = self.write();

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            ));
        }

        sessions.insert(
            id,
            SessionEntry {
                kind,
                started_at,
                state,
            },
        );
        Ok(())
    }

    pub fn remove(&self, id: &Uuid) -> bool {
        self.write().remove(id).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.read().len()
    }

    /// All live sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let now = Utc::now();
        let mut sessions: Vec<SessionInfo> = self
            .read()
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                kind: entry.kind,
                state: *entry.state.borrow(),
                started_at: entry.started_at,
                duration_seconds: now.signed_duration_since(entry.started_at).num_milliseconds() as f64 / 1000.0,
            })
            .collect();

        sessions.sort_by_key(|info| info.started_at);
        sessions
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.read();

        let mut by_kind = HashMap::new();
        let mut by_state = HashMap::new();
        for entry in sessions.values() {
            *by_kind.entry(entry.kind).or_insert(0) += 1;
            *by_state.entry(*entry.state.borrow()).or_insert(0) += 1;
        }

        RegistrySummary {
            active_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions,
            by_kind,
            by_state,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, SessionEntry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
