//! Process-local session store, used when no database is configured and as a test backend.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use tokio::{sync::RwLock, time::sleep};

use crate::{
    dao::{
        session_store::SessionStore,
        storage::{StorageError, StorageResult},
    },
    state::session::{LiveSession, SessionId},
};

/// Session store kept in process memory, with injectable latency and outages.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    sessions: RwLock<IndexMap<SessionId, LiveSession>>,
    latency_ms: AtomicU64,
    offline: AtomicBool,
    saves: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryInner {
    async fn gate(&self) -> StorageResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                "in-memory store is offline".into(),
                io::Error::new(io::ErrorKind::NotConnected, "offline"),
            ));
        }
        Ok(())
    }

    async fn select<F>(&self, keep: F) -> StorageResult<Vec<LiveSession>>
    where
        F: Fn(&LiveSession) -> bool,
    {
        self.gate().await?;
        let sessions = self.sessions.read().await;
        Ok(sessions.values().filter(|s| keep(s)).cloned().collect())
    }
}

impl InMemorySessionStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with `sessions`.
    pub async fn with_sessions(sessions: impl IntoIterator<Item = LiveSession>) -> Self {
        let store = Self::new();
        {
            let mut guard = store.inner.sessions.write().await;
            for session in sessions {
                guard.insert(session.id, session);
            }
        }
        store
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = latency.as_millis().try_into().unwrap_or(u64::MAX);
        self.inner.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }

    /// Number of completed deletes.
    pub fn delete_count(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    /// Read a session without latency or failure injection.
    pub async fn peek(&self, id: SessionId) -> Option<LiveSession> {
        self.inner.sessions.read().await.get(&id).cloned()
    }

    /// Overwrite a session without latency or failure injection, as a concurrent writer would.
    pub async fn put_direct(&self, session: LiveSession) {
        self.inner.sessions.write().await.insert(session.id, session);
    }
}

impl SessionStore for InMemorySessionStore {
    fn load_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<LiveSession>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.select(|s| !s.status.is_terminal()).await })
    }

    fn load_ended_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<LiveSession>>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.select(|s| s.status.is_terminal()).await })
    }

    fn load_session(&self, id: SessionId) -> BoxFuture<'static, StorageResult<Option<LiveSession>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.gate().await?;
            Ok(inner.sessions.read().await.get(&id).cloned())
        })
    }

    fn save_session(&self, session: LiveSession) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.gate().await?;
            inner.sessions.write().await.insert(session.id, session);
            inner.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn delete_session(&self, id: SessionId) -> BoxFuture<'static, StorageResult<bool>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.gate().await?;
            let removed = inner.sessions.write().await.shift_remove(&id).is_some();
            if removed {
                inner.deletes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(removed)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.gate().await })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.gate().await })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::state::session::SessionStatus;

    #[tokio::test]
    async fn partitions_split_on_terminal_status() {
        let active = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        let mut ended = LiveSession::competitive(Uuid::new_v4(), "cid", "dan", 0);
        ended.status = SessionStatus::NoContest;
        let store = InMemorySessionStore::with_sessions([active.clone(), ended.clone()]).await;

        assert_eq!(store.load_active_sessions().await.unwrap(), vec![active]);
        assert_eq!(store.load_ended_sessions().await.unwrap(), vec![ended]);
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = InMemorySessionStore::new();
        store.set_offline(true);
        assert!(store.health_check().await.is_err());
        assert!(store.load_session(Uuid::new_v4()).await.is_err());
        store.set_offline(false);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        let store = InMemorySessionStore::with_sessions([session.clone()]).await;
        assert!(store.delete_session(session.id).await.unwrap());
        assert!(!store.delete_session(session.id).await.unwrap());
        assert_eq!(store.delete_count(), 1);
    }
}
