use std::{cmp::Ordering, collections::HashSet};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::state::{
    conflict,
    session::{LiveSession, SessionId, Timestamp},
};

struct CacheEntry {
    session: LiveSession,
    cached_at: Timestamp,
}

/// Volatile copy of live sessions kept in front of the session store.
///
/// Holds per-session read-through entries plus the last good result of loading every active
/// session, which is what a tick falls back to when the store does not answer in time.
pub struct SessionCache {
    entries: DashMap<SessionId, CacheEntry>,
    active_snapshot: RwLock<Option<Vec<LiveSession>>>,
    ttl_ms: u64,
}

impl SessionCache {
    /// Build an empty cache whose entries expire after `ttl_ms`.
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: DashMap::new(),
            active_snapshot: RwLock::new(None),
            ttl_ms,
        }
    }

    /// Remember a successful load of every active session.
    pub async fn remember_active(&self, sessions: &[LiveSession], now: Timestamp) {
        for session in sessions {
            self.put(session.clone(), now);
        }
        *self.active_snapshot.write().await = Some(sessions.to_vec());
    }

    /// Last good active-session load, if any.
    pub async fn active_snapshot(&self) -> Option<Vec<LiveSession>> {
        self.active_snapshot.read().await.clone()
    }

    /// Last good active-session load with every session replaced by its newest known copy.
    ///
    /// Writes made since the load only reach the per-session entries. Sessions whose newest
    /// copy is terminal are left out.
    pub async fn freshest_snapshot(&self) -> Option<Vec<LiveSession>> {
        let snapshot = self.active_snapshot.read().await.clone()?;
        Some(
            snapshot
                .into_iter()
                .map(|loaded| match self.peek(loaded.id) {
                    Some(cached) if conflict::compare(&cached, &loaded) == Ordering::Greater => {
                        cached
                    }
                    _ => loaded,
                })
                .filter(|session| !session.status.is_terminal())
                .collect(),
        )
    }

    /// Store `session`, replacing an older entry.
    pub fn put(&self, session: LiveSession, now: Timestamp) {
        self.entries.insert(
            session.id,
            CacheEntry {
                session,
                cached_at: now,
            },
        );
    }

    /// Fresh entry for `id`; expired entries are treated as misses.
    pub fn get(&self, id: SessionId, now: Timestamp) -> Option<LiveSession> {
        self.entries
            .get(&id)
            .filter(|entry| now.saturating_sub(entry.cached_at) <= self.ttl_ms)
            .map(|entry| entry.session.clone())
    }

    /// Best previously-known copy of `id`, regardless of age.
    pub fn peek(&self, id: SessionId) -> Option<LiveSession> {
        self.entries.get(&id).map(|entry| entry.session.clone())
    }

    /// Forget `id` everywhere, including the active snapshot.
    pub async fn forget(&self, id: SessionId) {
        self.entries.remove(&id);
        if let Some(snapshot) = self.active_snapshot.write().await.as_mut() {
            snapshot.retain(|session| session.id != id);
        }
    }

    /// Level 1 eviction: drop entries older than the TTL.
    pub fn evict_expired(&self, now: Timestamp) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.cached_at) <= self.ttl_ms);
        before.saturating_sub(self.entries.len())
    }

    /// Level 2 eviction: keep only non-terminal sessions from the last active load.
    pub async fn evict_inactive(&self) -> usize {
        let active: HashSet<SessionId> = self
            .active_snapshot
            .read()
            .await
            .as_ref()
            .map(|sessions| sessions.iter().map(|session| session.id).collect())
            .unwrap_or_default();

        let before = self.entries.len();
        self.entries.retain(|id, entry| {
            active.contains(id) && !entry.session.status.is_terminal()
        });
        before.saturating_sub(self.entries.len())
    }

    /// Level 3 eviction: drop everything, including the active snapshot.
    pub async fn clear(&self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        *self.active_snapshot.write().await = None;
        dropped
    }

    /// Number of per-session entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no per-session entry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::state::session::SessionStatus;

    fn session() -> LiveSession {
        LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0)
    }

    #[test]
    fn expired_entries_miss_but_remain_peekable() {
        let cache = SessionCache::new(100);
        let s = session();
        cache.put(s.clone(), 0);
        assert!(cache.get(s.id, 100).is_some());
        assert!(cache.get(s.id, 101).is_none());
        assert_eq!(cache.peek(s.id), Some(s));
    }

    #[tokio::test]
    async fn eviction_levels_escalate() {
        let cache = SessionCache::new(100);
        let active = session();
        let mut finished = session();
        finished.status = SessionStatus::Ended;
        let stray = session();

        cache.remember_active(&[active.clone(), finished.clone()], 0).await;
        cache.put(stray.clone(), 500);

        assert_eq!(cache.evict_expired(500), 2);
        cache.remember_active(&[active.clone(), finished.clone()], 500).await;
        assert_eq!(cache.len(), 3);

        assert_eq!(cache.evict_inactive().await, 2);
        assert!(cache.peek(active.id).is_some());

        assert_eq!(cache.clear().await, 1);
        assert!(cache.active_snapshot().await.is_none());
    }

    #[tokio::test]
    async fn fallback_snapshot_prefers_newer_entries() {
        let cache = SessionCache::new(100);
        let running = session();
        let other = session();
        cache.remember_active(&[running.clone(), other.clone()], 0).await;

        let mut advanced = running.clone();
        advanced.touch(50);
        cache.put(advanced.clone(), 50);
        let mut regressed = other.clone();
        regressed.revision = 0;
        regressed.moves.clear();
        cache.put(regressed, 50);

        let snapshot = cache.freshest_snapshot().await.unwrap();
        assert_eq!(snapshot, vec![advanced.clone(), other.clone()]);

        let mut voided = advanced;
        voided.status = SessionStatus::NoContest;
        voided.touch(60);
        cache.put(voided, 60);
        assert_eq!(cache.freshest_snapshot().await.unwrap(), vec![other]);
    }

    #[tokio::test]
    async fn forget_also_drops_the_snapshot_copy() {
        let cache = SessionCache::new(100);
        let s = session();
        cache.remember_active(&[s.clone()], 0).await;
        cache.forget(s.id).await;
        assert!(cache.peek(s.id).is_none());
        assert_eq!(cache.active_snapshot().await, Some(Vec::new()));
    }
}
