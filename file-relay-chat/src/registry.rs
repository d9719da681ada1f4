//! Shared set of live sessions and the fan-out built on it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    relay::{ChatMessage, FileTransfer},
    session::{Session, SessionId},
};

/// Every membership change and every fan-out snapshot takes the same lock.
/// Deliveries then run on the snapshot with the lock released, so one slow
/// recipient never blocks joins or leaves.
pub struct Registry {
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn register(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id(), session);
    }

    pub async fn deregister(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn active_count(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|session| session.is_active()).count()
    }

    pub async fn active_names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|session| session.is_active())
            .filter_map(|session| session.name().map(str::to_string))
            .collect()
    }

    async fn snapshot(&self, excluding: Option<SessionId>) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .filter(|session| Some(session.id()) != excluding)
            .cloned()
            .collect()
    }

    pub async fn broadcast_text(&self, message: &ChatMessage, excluding: SessionId) -> usize {
        let line = message.to_string();
        if line.contains(['\n', '\r']) {
            warn!(sender = %message.sender, "refusing to relay a message with a line break");
            return 0;
        }

        let mut delivered = 0;
        for session in self.snapshot(Some(excluding)).await {
            if session.send_message(&line).await {
                delivered += 1;
            } else {
                debug!(session = session.id(), "skipped recipient");
            }
        }
        delivered
    }

    pub async fn broadcast_file(&self, transfer: &FileTransfer, excluding: SessionId) -> usize {
        let mut delivered = 0;
        for session in self.snapshot(Some(excluding)).await {
            if session.send_file(transfer).await {
                delivered += 1;
            } else {
                debug!(session = session.id(), file = %transfer.name, "skipped recipient");
            }
        }
        delivered
    }

    pub async fn close_all(&self) {
        let sessions = self.snapshot(None).await;
        info!(sessions = sessions.len(), "closing all sessions");
        for session in sessions {
            session.close().await;
        }
    }
}
