//! Process-wide map of live client sessions, keyed by connection identity.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::client::ClientSession;

/// Holds strong ownership of every [`ClientSession`]; teardown is always
/// initiated here so a session is stopped exactly once.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<ClientSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<ClientSession>) {
        let mut sessions = self.sessions.write().await;
        if sessions.insert(session.id, session).is_some() {
            // Connection ids are fresh v4 uuids; a collision means a bug.
            tracing::error!("Replaced an existing session under the same id");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove and tear down one session. Safe to call for ids that are
    /// already gone.
    pub async fn remove_and_close(&self, id: Uuid) {
        let session = { self.sessions.write().await.remove(&id) };
        if let Some(session) = session {
            tracing::info!(client_id = %id, "Client disconnected, closing session");
            session.close().await;
        }
    }

    /// Drain every session; used on server shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close().await;
        }
    }
}
