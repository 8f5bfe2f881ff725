//! Registry of the sessions a manager is currently pumping.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::handle::SessionHandle;

/// Active session handles keyed by session ID.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its session ID.
    pub async fn insert(&self, handle: Arc<SessionHandle>) {
        let id = handle.session_id().to_string();
        debug!(session_id = %id, "Registering session");
        if let Some(previous) = self.sessions.write().await.insert(id, handle) {
            warn!(
                session_id = %previous.session_id(),
                "Replaced a session handle that was still registered"
            );
        }
    }

    /// Remove `handle` if it is still the one registered under its ID.
    pub async fn remove(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        let registered = sessions
            .get(handle.session_id())
            .is_some_and(|current| Arc::ptr_eq(current, handle));
        if registered {
            debug!(session_id = %handle.session_id(), "Unregistering session");
            sessions.remove(handle.session_id());
        }
        registered
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// IDs of all registered sessions.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of all registered handles.
    pub async fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.read().await.values().cloned().collect()
    }
}
