use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::types::{SessionBuffers, SessionStatus};

/// Runtime state for one resident session.
///
/// The `buffers` mutex is the per-session serialization point: ingest holds
/// it to append, the scheduler holds it across a whole pipeline pass, so a
/// second tick can never preempt an in-flight one. Status lives behind its
/// own lock so pause/cancel take effect without waiting for the pipeline.
pub struct SessionHandle {
    pub id: String,
    pub user_id: String,
    pub started_at: DateTime<Utc>,
    status: RwLock<SessionStatus>,
    pub buffers: Mutex<SessionBuffers>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(id: String, user_id: String, started_at: DateTime<Utc>, status: SessionStatus) -> Self {
        Self {
            id,
            user_id,
            started_at,
            status: RwLock::new(status),
            buffers: Mutex::new(SessionBuffers::default()),
            scheduler: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.read().await
    }

    pub async fn set_status(&self, status: SessionStatus) {
        *self.status.write().await = status;
    }

    /// Install a scheduler task, aborting any previous one
    pub async fn arm_scheduler(&self, task: JoinHandle<()>) {
        let mut guard = self.scheduler.lock().await;
        if let Some(old) = guard.replace(task) {
            old.abort();
        }
    }

    /// Abort the scheduler task if one is armed
    pub async fn disarm_scheduler(&self) {
        if let Some(task) = self.scheduler.lock().await.take() {
            task.abort();
        }
    }

    pub async fn scheduler_armed(&self) -> bool {
        self.scheduler
            .lock()
            .await
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }
}

/// In-memory registry of resident sessions.
///
/// The map lock is only held for insert/lookup/remove; all per-session
/// state sits behind the entry's own locks.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session. Fails (returns false) on ID collision.
    pub async fn insert(&self, handle: Arc<SessionHandle>) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&handle.id) {
            return false;
        }
        sessions.insert(handle.id.clone(), handle);
        true
    }

    pub async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn remove(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(
            id.to_string(),
            "user-1".to_string(),
            Utc::now(),
            SessionStatus::Recording,
        ))
    }

    #[tokio::test]
    async fn test_insert_rejects_collision() {
        let registry = SessionRegistry::new();
        assert!(registry.insert(handle("sess-a")).await);
        assert!(!registry.insert(handle("sess-a")).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_returns_handle() {
        let registry = SessionRegistry::new();
        registry.insert(handle("sess-a")).await;
        assert!(registry.remove("sess-a").await.is_some());
        assert!(registry.remove("sess-a").await.is_none());
        assert!(registry.get("sess-a").await.is_none());
    }

    #[tokio::test]
    async fn test_status_flip_does_not_need_buffer_lock() {
        let registry = SessionRegistry::new();
        registry.insert(handle("sess-a")).await;
        let entry = registry.get("sess-a").await.unwrap();

        // Hold the buffer lock as an in-flight tick would
        let _guard = entry.buffers.lock().await;
        entry.set_status(SessionStatus::Cancelled).await;
        assert_eq!(entry.status().await, SessionStatus::Cancelled);
    }
}
