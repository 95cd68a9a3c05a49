//! In-memory registries owned by the process: connections, user statuses, negotiations,
//! pending notices and ephemeral chat. Each table is its own synchronized façade.

use std::collections::VecDeque;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::state::session::{LiveSession, SessionId, Timestamp, UserId};

/// Identifier of a negotiation.
pub type NegotiationId = Uuid;

/// Liveness records: user → last heartbeat.
#[derive(Default)]
pub struct ConnectionRegistry {
    heartbeats: DashMap<UserId, Timestamp>,
}

impl ConnectionRegistry {
    /// Refresh (or create) the heartbeat of `user`.
    pub fn touch(&self, user: &str, now: Timestamp) {
        self.heartbeats
            .entry(user.to_owned())
            .and_modify(|seen| *seen = (*seen).max(now))
            .or_insert(now);
    }

    /// Create a heartbeat for `user` only if none exists.
    pub fn touch_if_absent(&self, user: &str, now: Timestamp) {
        self.heartbeats.entry(user.to_owned()).or_insert(now);
    }

    /// Last heartbeat of `user`.
    pub fn last_seen(&self, user: &str) -> Option<Timestamp> {
        self.heartbeats.get(user).map(|entry| *entry.value())
    }

    /// Whether `user` has a connection record.
    pub fn is_connected(&self, user: &str) -> bool {
        self.heartbeats.contains_key(user)
    }

    /// Users whose heartbeat is older than `timeout_ms`.
    pub fn stale(&self, now: Timestamp, timeout_ms: u64) -> Vec<UserId> {
        self.heartbeats
            .iter()
            .filter(|entry| now.saturating_sub(*entry.value()) > timeout_ms)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove `user` if their heartbeat is still stale; a concurrent refresh wins.
    pub fn remove_if_stale(&self, user: &str, now: Timestamp, timeout_ms: u64) -> bool {
        self.heartbeats
            .remove_if(user, |_, seen| now.saturating_sub(*seen) > timeout_ms)
            .is_some()
    }

    /// Number of connection records.
    pub fn len(&self) -> usize {
        self.heartbeats.len()
    }

    /// Whether no one is connected.
    pub fn is_empty(&self) -> bool {
        self.heartbeats.is_empty()
    }
}

/// Coarse activity of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    /// Connected, not yet looking for a game.
    Online,
    /// Available for a game.
    Waiting,
    /// Seated in a session.
    InGame,
    /// Watching a session.
    Spectating,
    /// Party to a pending challenge or rematch offer.
    Negotiating,
}

/// Status entry of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatus {
    /// Current activity.
    pub status: PresenceStatus,
    /// Session the user is (or was last) seated in.
    pub session_id: Option<SessionId>,
    /// Session the user is watching.
    pub spectating: Option<SessionId>,
}

impl UserStatus {
    /// Plain waiting status with no session attached.
    pub fn waiting() -> Self {
        Self {
            status: PresenceStatus::Waiting,
            session_id: None,
            spectating: None,
        }
    }

    /// Whether the user is looking at `session` either as a player or a spectator.
    pub fn watches(&self, session: SessionId) -> bool {
        self.session_id == Some(session) || self.spectating == Some(session)
    }
}

/// User → status table.
#[derive(Default)]
pub struct StatusRegistry {
    entries: DashMap<UserId, UserStatus>,
}

impl StatusRegistry {
    /// Current status of `user`.
    pub fn get(&self, user: &str) -> Option<UserStatus> {
        self.entries.get(user).map(|entry| entry.value().clone())
    }

    /// Replace the status of `user`.
    pub fn set(&self, user: &str, status: UserStatus) {
        self.entries.insert(user.to_owned(), status);
    }

    /// Insert `status` only when `user` has no entry yet; returns the resulting entry.
    pub fn get_or_insert(&self, user: &str, status: UserStatus) -> UserStatus {
        self.entries
            .entry(user.to_owned())
            .or_insert(status)
            .value()
            .clone()
    }

    /// Mutate the entry of `user` in place, if present.
    pub fn update<F>(&self, user: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut UserStatus),
    {
        match self.entries.get_mut(user) {
            Some(mut entry) => {
                mutate(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Mark `user` as seated in `session`.
    pub fn seat(&self, user: &str, session: SessionId) {
        self.set(
            user,
            UserStatus {
                status: PresenceStatus::InGame,
                session_id: Some(session),
                spectating: None,
            },
        );
    }

    /// The session `user` sat in is over: they become available but keep looking at it.
    pub fn finish_session(&self, user: &str, session: SessionId) {
        self.update(user, |entry| {
            if entry.session_id == Some(session) {
                entry.status = PresenceStatus::Waiting;
            }
        });
    }

    /// Detach `user` from `session` entirely and make them available.
    pub fn release_session(&self, user: &str, session: SessionId) {
        self.update(user, |entry| {
            if entry.session_id == Some(session) {
                *entry = UserStatus::waiting();
            }
        });
    }

    /// Forget any reference to `session` held by `user`.
    pub fn detach(&self, user: &str, session: SessionId) {
        self.update(user, |entry| {
            if entry.session_id == Some(session) {
                entry.session_id = None;
            }
            if entry.spectating == Some(session) {
                entry.spectating = None;
                if entry.status == PresenceStatus::Spectating {
                    entry.status = PresenceStatus::Waiting;
                }
            }
        });
    }

    /// Revert a negotiating user to waiting. Users bound to a game are left alone.
    pub fn release_from_negotiation(&self, user: &str) -> bool {
        let mut released = false;
        self.update(user, |entry| {
            if entry.status == PresenceStatus::Negotiating {
                entry.status = PresenceStatus::Waiting;
                released = true;
            }
        });
        released
    }

    /// Users currently spectating `session`.
    pub fn spectators_of(&self, session: SessionId) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|entry| entry.value().spectating == Some(session))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Users whose entry references `session` as player or spectator.
    pub fn watchers_of(&self, session: SessionId) -> Vec<UserId> {
        self.entries
            .iter()
            .filter(|entry| entry.value().watches(session))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop every entry for which `keep` returns false. Returns the number removed.
    pub fn prune<F>(&self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|user, _| keep(user));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Kind of offer under negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationKind {
    /// Fresh challenge between two users.
    Challenge,
    /// Rematch proposed after a finished session.
    Rematch,
}

/// State of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    /// Awaiting an answer.
    Pending,
    /// Accepted by the recipient.
    Accepted,
    /// Declined by the recipient.
    Rejected,
}

/// A time-boxed challenge or rematch offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    /// Identifier.
    pub id: NegotiationId,
    /// Challenge or rematch.
    pub kind: NegotiationKind,
    /// Offering user.
    pub from: UserId,
    /// Receiving user.
    pub to: UserId,
    /// Finished session a rematch refers to.
    pub source_session: Option<SessionId>,
    /// Instant after which the offer is void.
    pub deadline: Timestamp,
    /// Current state.
    pub status: NegotiationStatus,
}

impl Negotiation {
    /// Whether `user` is one of the two parties.
    pub fn involves(&self, user: &str) -> bool {
        self.from == user || self.to == user
    }

    /// Whether the offer is still awaiting an answer at `now`.
    pub fn is_pending(&self, now: Timestamp) -> bool {
        self.status == NegotiationStatus::Pending && now <= self.deadline
    }
}

/// Negotiation id → negotiation table.
#[derive(Default)]
pub struct NegotiationTable {
    entries: DashMap<NegotiationId, Negotiation>,
}

impl NegotiationTable {
    /// Register a new offer.
    pub fn insert(&self, negotiation: Negotiation) {
        self.entries.insert(negotiation.id, negotiation);
    }

    /// Look up an offer.
    pub fn get(&self, id: NegotiationId) -> Option<Negotiation> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    /// Mutate an offer in place; returns the updated copy.
    pub fn update<F>(&self, id: NegotiationId, mutate: F) -> Option<Negotiation>
    where
        F: FnOnce(&mut Negotiation),
    {
        let mut entry = self.entries.get_mut(&id)?;
        mutate(entry.value_mut());
        Some(entry.value().clone())
    }

    /// Remove and return every offer past its deadline. Each offer is returned at most once.
    pub fn expire(&self, now: Timestamp) -> Vec<Negotiation> {
        let due: Vec<NegotiationId> = self
            .entries
            .iter()
            .filter(|entry| now > entry.value().deadline)
            .map(|entry| *entry.key())
            .collect();

        due.into_iter()
            .filter_map(|id| {
                self.entries
                    .remove_if(&id, |_, negotiation| now > negotiation.deadline)
                    .map(|(_, negotiation)| negotiation)
            })
            .collect()
    }

    /// Whether `user` is party to an offer still pending at `now`.
    pub fn binds(&self, user: &str, now: Timestamp) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.value().involves(user) && entry.value().is_pending(now))
    }

    /// Whether a pending rematch offer refers to `session`.
    pub fn references_session(&self, session: SessionId, now: Timestamp) -> bool {
        self.entries.iter().any(|entry| {
            entry.value().source_session == Some(session) && entry.value().is_pending(now)
        })
    }

    /// Offers involving `user`.
    pub fn involving(&self, user: &str) -> Vec<Negotiation> {
        self.entries
            .iter()
            .filter(|entry| entry.value().involves(user))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of offers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One-shot notices delivered on the user's next state fetch.
#[derive(Default)]
pub struct NoticeBox {
    pending: DashMap<UserId, String>,
}

impl NoticeBox {
    /// Queue `message` for `user`, replacing any undelivered notice.
    pub fn queue(&self, user: &str, message: impl Into<String>) {
        self.pending.insert(user.to_owned(), message.into());
    }

    /// Take the pending notice of `user`; a second call returns nothing.
    pub fn take(&self, user: &str) -> Option<String> {
        self.pending.remove(user).map(|(_, message)| message)
    }

    /// Whether `user` has a notice waiting.
    pub fn has_pending(&self, user: &str) -> bool {
        self.pending.contains_key(user)
    }
}

/// One line of session chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    /// Author, `None` for system messages.
    pub author: Option<UserId>,
    /// Message text.
    pub text: String,
    /// When the line was appended.
    pub at: Timestamp,
}

/// Ephemeral per-session chat, bounded per session.
pub struct ChatLog {
    lines: DashMap<SessionId, VecDeque<ChatLine>>,
    limit: usize,
}

impl ChatLog {
    /// Build a chat log keeping at most `limit` lines per session.
    pub fn new(limit: usize) -> Self {
        Self {
            lines: DashMap::new(),
            limit: limit.max(1),
        }
    }

    /// Append system messages to the chat of `session`.
    pub fn append_system<I>(&self, session: SessionId, messages: I, now: Timestamp)
    where
        I: IntoIterator<Item = String>,
    {
        let mut entry = self.lines.entry(session).or_default();
        for text in messages {
            entry.push_back(ChatLine {
                author: None,
                text,
                at: now,
            });
        }
        while entry.len() > self.limit {
            entry.pop_front();
        }
    }

    /// Lines currently retained for `session`, oldest first.
    pub fn recent(&self, session: SessionId) -> Vec<ChatLine> {
        self.lines
            .get(&session)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the chat of `session`.
    pub fn remove(&self, session: SessionId) {
        self.lines.remove(&session);
    }
}

/// Every in-memory table the reconciler and the request paths share.
pub struct LiveRegistry {
    /// User → last heartbeat.
    pub connections: ConnectionRegistry,
    /// User → status.
    pub statuses: StatusRegistry,
    /// Pending challenge and rematch offers.
    pub negotiations: NegotiationTable,
    /// Undelivered mutual-abandonment notices.
    pub notices: NoticeBox,
    /// Ephemeral chat.
    pub chat: ChatLog,
}

impl LiveRegistry {
    /// Build empty tables.
    pub fn new(chat_history_limit: usize) -> Self {
        Self {
            connections: ConnectionRegistry::default(),
            statuses: StatusRegistry::default(),
            negotiations: NegotiationTable::default(),
            notices: NoticeBox::default(),
            chat: ChatLog::new(chat_history_limit),
        }
    }

    /// Re-seed connections and statuses from durable sessions after a restart.
    ///
    /// Every human participant of an active session gets a fresh heartbeat so they have one
    /// full heartbeat timeout to reappear before the disconnect lifecycle kicks in.
    pub fn rebuild_from_sessions(&self, sessions: &[LiveSession], now: Timestamp) -> usize {
        let mut seeded = 0;
        for session in sessions.iter().filter(|s| !s.status.is_terminal()) {
            for user in session.human_participants() {
                if self.statuses.get(user).is_none() {
                    self.statuses.seat(user, session.id);
                    seeded += 1;
                }
                self.connections.touch_if_absent(user, now);
            }
        }
        seeded
    }

    /// Whether `session` has a connected participant or spectator looking at it.
    pub fn is_watched(&self, session: SessionId) -> bool {
        self.statuses
            .watchers_of(session)
            .iter()
            .any(|user| self.connections.is_connected(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(from: &str, to: &str, deadline: Timestamp) -> Negotiation {
        Negotiation {
            id: Uuid::new_v4(),
            kind: NegotiationKind::Challenge,
            from: from.into(),
            to: to.into(),
            source_session: None,
            deadline,
            status: NegotiationStatus::Pending,
        }
    }

    #[test]
    fn stale_connections_respect_concurrent_refresh() {
        let connections = ConnectionRegistry::default();
        connections.touch("ada", 0);
        assert_eq!(connections.stale(31_000, 30_000), vec!["ada".to_string()]);

        connections.touch("ada", 31_000);
        assert!(!connections.remove_if_stale("ada", 31_000, 30_000));
        assert!(connections.is_connected("ada"));
    }

    #[test]
    fn notices_are_delivered_at_most_once() {
        let notices = NoticeBox::default();
        notices.queue("ada", "your game was closed");
        notices.queue("ada", "your game was closed");
        assert_eq!(notices.take("ada").as_deref(), Some("your game was closed"));
        assert_eq!(notices.take("ada"), None);
    }

    #[test]
    fn expired_negotiations_are_removed_exactly_once() {
        let table = NegotiationTable::default();
        let expired = offer("ada", "bob", 100);
        let live = offer("ada", "cid", 500);
        table.insert(expired.clone());
        table.insert(live.clone());

        let removed = table.expire(101);
        assert_eq!(removed, vec![expired]);
        assert!(table.expire(101).is_empty());
        assert!(table.get(live.id).is_some());
        assert!(table.binds("ada", 101));
        assert!(!table.binds("bob", 101));
    }

    #[test]
    fn deadline_instant_itself_is_not_expired() {
        let table = NegotiationTable::default();
        table.insert(offer("ada", "bob", 100));
        assert!(table.expire(100).is_empty());
        assert_eq!(table.expire(101).len(), 1);
    }

    #[test]
    fn negotiation_release_leaves_players_in_game_alone() {
        let statuses = StatusRegistry::default();
        let session = Uuid::new_v4();
        statuses.seat("ada", session);
        statuses.set(
            "bob",
            UserStatus {
                status: PresenceStatus::Negotiating,
                session_id: None,
                spectating: None,
            },
        );

        assert!(!statuses.release_from_negotiation("ada"));
        assert!(statuses.release_from_negotiation("bob"));
        assert_eq!(statuses.get("ada").unwrap().status, PresenceStatus::InGame);
        assert_eq!(statuses.get("bob").unwrap().status, PresenceStatus::Waiting);
    }

    #[test]
    fn chat_is_bounded_per_session() {
        let chat = ChatLog::new(2);
        let session = Uuid::new_v4();
        chat.append_system(session, ["a".to_string(), "b".to_string(), "c".to_string()], 5);
        let texts: Vec<_> = chat.recent(session).into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["b", "c"]);
    }

    #[test]
    fn rebuild_seeds_humans_of_active_sessions_only() {
        let registry = LiveRegistry::new(10);
        let mut finished = LiveSession::competitive(Uuid::new_v4(), "old", "timer", 0);
        finished.status = crate::state::session::SessionStatus::Ended;
        let practice = LiveSession::practice(Uuid::new_v4(), "ada", "bot:easy", 0);
        let duel = LiveSession::competitive(Uuid::new_v4(), "bob", "cid", 0);

        let seeded = registry.rebuild_from_sessions(&[finished, practice.clone(), duel], 42);

        assert_eq!(seeded, 3);
        assert_eq!(registry.connections.last_seen("ada"), Some(42));
        assert!(!registry.connections.is_connected("bot:easy"));
        assert!(!registry.connections.is_connected("old"));
        assert_eq!(
            registry.statuses.get("ada").unwrap().session_id,
            Some(practice.id)
        );
    }

    #[test]
    fn watched_requires_a_connected_watcher() {
        let registry = LiveRegistry::new(10);
        let session = Uuid::new_v4();
        registry.statuses.seat("ada", session);
        assert!(!registry.is_watched(session));
        registry.connections.touch("ada", 1);
        assert!(registry.is_watched(session));
    }
}
