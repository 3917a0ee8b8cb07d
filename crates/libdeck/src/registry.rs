use serde::{Deserialize, Serialize};
use tracing::warn;

use deck_protocol::{HandleId, SessionId};

use crate::error::DeckResult;
use crate::store::StateStore;

const SESSIONS_NAMESPACE: &str = "terminal_sessions";
const PENDING_NAMESPACE: &str = "pending_executions";

/// Durable record that lets a terminal tab resume its server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRegistryEntry {
    pub handle_id: HandleId,
    pub session_id: SessionId,
    pub label: String,
}

#[derive(Serialize, Deserialize)]
struct StoredSession {
    session_id: SessionId,
    label: String,
}

/// `handle_id -> {session_id, label}`, surviving restarts.
#[derive(Clone)]
pub struct SessionRegistry {
    store: StateStore,
}

impl SessionRegistry {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn put(&self, handle_id: &str, session_id: &str, label: &str) -> DeckResult<()> {
        let value = serde_json::to_string(&StoredSession {
            session_id: session_id.to_string(),
            label: label.to_string(),
        })?;
        self.store.put(SESSIONS_NAMESPACE, handle_id, &value)
    }

    /// Every entry, oldest first. Unreadable values are skipped.
    pub fn get_all(&self) -> DeckResult<Vec<SessionRegistryEntry>> {
        let entries = self
            .store
            .entries(SESSIONS_NAMESPACE)?
            .into_iter()
            .filter_map(|(handle_id, value)| {
                match serde_json::from_str::<StoredSession>(&value) {
                    Ok(stored) => Some(SessionRegistryEntry {
                        handle_id,
                        session_id: stored.session_id,
                        label: stored.label,
                    }),
                    Err(e) => {
                        warn!(handle_id = %handle_id, error = %e, "skipping unreadable registry entry");
                        None
                    }
                }
            })
            .collect();
        Ok(entries)
    }

    pub fn remove(&self, handle_id: &str) -> DeckResult<bool> {
        self.store.remove(SESSIONS_NAMESPACE, handle_id)
    }
}

/// `correlation_key -> execution_id` for work that may finish while we are away.
#[derive(Clone)]
pub struct PendingExecutionIndex {
    store: StateStore,
}

impl PendingExecutionIndex {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn put(&self, correlation_key: &str, execution_id: &str) -> DeckResult<()> {
        self.store.put(PENDING_NAMESPACE, correlation_key, execution_id)
    }

    pub fn get_all(&self) -> DeckResult<Vec<(String, String)>> {
        self.store.entries(PENDING_NAMESPACE)
    }

    pub fn remove(&self, correlation_key: &str) -> DeckResult<bool> {
        self.store.remove(PENDING_NAMESPACE, correlation_key)
    }
}
