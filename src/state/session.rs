//! Live session records as held by the reconciler and persisted by the session store.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Identifier of a live session.
pub type SessionId = Uuid;
/// Identifier of a platform user.
pub type UserId = String;
/// Wall-clock instant in milliseconds since the UNIX epoch.
pub type Timestamp = u64;

/// Lifecycle status of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, waiting for the first move.
    Waiting,
    /// Both participants are playing.
    InProgress,
    /// One participant dropped and the session is held open for reconnection.
    DisconnectGrace,
    /// Play is over and the result is being tallied.
    Scoring,
    /// Finished with a result.
    Ended,
    /// Finished without a result (voided).
    NoContest,
}

impl SessionStatus {
    /// Whether the session has reached a final status.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::NoContest)
    }
}

/// Kind of a session, which decides the disconnect and eviction rules applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Two human participants; disconnects are penalised.
    Competitive,
    /// One human against a simulated opponent seated at [`Seat::B`]; never penalised.
    Practice,
}

/// One of the two participant seats of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Seat {
    /// First participant (moves first).
    A,
    /// Second participant.
    B,
}

impl Seat {
    /// Both seats in table order.
    pub const ALL: [Seat; 2] = [Seat::A, Seat::B];

    /// Index into per-seat arrays.
    pub fn index(self) -> usize {
        match self {
            Seat::A => 0,
            Seat::B => 1,
        }
    }

    /// The opposing seat.
    pub fn other(self) -> Seat {
        match self {
            Seat::A => Seat::B,
            Seat::B => Seat::A,
        }
    }
}

/// Record of an ongoing disconnect grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectionState {
    /// Seat of the absent participant.
    pub seat: Seat,
    /// When the grace window started.
    pub since: Timestamp,
    /// Whether the present opponent may void the session instead of waiting.
    pub claim_void_available: bool,
}

/// A single game instance between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSession {
    /// Primary key.
    pub id: SessionId,
    /// Competitive or practice.
    pub kind: SessionKind,
    /// Participants seated at A and B.
    pub participants: [UserId; 2],
    /// Ordered move list (opaque to the reconciler).
    pub moves: Vec<String>,
    /// Current status.
    pub status: SessionStatus,
    /// Monotonic counter bumped by every authoritative mutation.
    pub revision: u64,
    /// Time of the last accepted write.
    pub last_synced_at: Timestamp,
    /// Deadline of the current turn, if a turn clock runs.
    pub turn_deadline: Option<Timestamp>,
    /// Winner, once decided.
    pub winner: Option<UserId>,
    /// Ongoing grace window, if any.
    pub disconnection: Option<DisconnectionState>,
    /// Number of disconnect timeouts recorded per seat.
    pub disconnection_counts: [u32; 2],
    /// System messages to append to the chat before the next broadcast.
    #[serde(default)]
    pub pending_system_messages: Vec<String>,
}

/// Malformed or inconsistent session data detected while processing a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    /// A participant identifier is empty.
    #[error("session `{id}` has an empty participant identifier")]
    EmptyParticipant {
        /// Offending session.
        id: SessionId,
    },
    /// Both seats hold the same participant.
    #[error("session `{id}` seats the same participant twice")]
    DuplicateParticipant {
        /// Offending session.
        id: SessionId,
    },
    /// A processing step moved the revision backwards.
    #[error("session `{id}` revision regressed from {before} to {after}")]
    RevisionRegressed {
        /// Offending session.
        id: SessionId,
        /// Revision before the step.
        before: u64,
        /// Revision after the step.
        after: u64,
    },
    /// A processing step replaced the participants.
    #[error("session `{id}` participants changed during a step")]
    ParticipantsChanged {
        /// Offending session.
        id: SessionId,
    },
}

impl LiveSession {
    /// Build a fresh competitive session in the waiting status.
    pub fn competitive(id: SessionId, a: impl Into<UserId>, b: impl Into<UserId>, now: Timestamp) -> Self {
        Self::new(id, SessionKind::Competitive, [a.into(), b.into()], now)
    }

    /// Build a fresh practice session against a simulated opponent.
    pub fn practice(id: SessionId, player: impl Into<UserId>, bot: impl Into<UserId>, now: Timestamp) -> Self {
        Self::new(id, SessionKind::Practice, [player.into(), bot.into()], now)
    }

    fn new(id: SessionId, kind: SessionKind, participants: [UserId; 2], now: Timestamp) -> Self {
        Self {
            id,
            kind,
            participants,
            moves: Vec::new(),
            status: SessionStatus::Waiting,
            revision: 0,
            last_synced_at: now,
            turn_deadline: None,
            winner: None,
            disconnection: None,
            disconnection_counts: [0, 0],
            pending_system_messages: Vec::new(),
        }
    }

    /// Participant seated at `seat`.
    pub fn participant(&self, seat: Seat) -> &str {
        &self.participants[seat.index()]
    }

    /// Seat occupied by `user`, if they take part in this session.
    pub fn seat_of(&self, user: &str) -> Option<Seat> {
        Seat::ALL
            .into_iter()
            .find(|seat| self.participant(*seat) == user)
    }

    /// Participants that are humans (the simulated practice opponent is excluded).
    pub fn human_participants(&self) -> impl Iterator<Item = &str> {
        let humans = match self.kind {
            SessionKind::Competitive => 2,
            SessionKind::Practice => 1,
        };
        self.participants.iter().take(humans).map(String::as_str)
    }

    /// Seat whose turn it is, derived from move parity.
    pub fn turn_owner(&self) -> Seat {
        if self.moves.len() % 2 == 0 {
            Seat::A
        } else {
            Seat::B
        }
    }

    /// Record an authoritative mutation made at `now`.
    pub fn touch(&mut self, now: Timestamp) {
        self.revision += 1;
        self.last_synced_at = self.last_synced_at.max(now);
    }

    /// End the session with `seat` as the winner.
    pub fn end_in_favor_of(&mut self, seat: Seat, now: Timestamp) {
        self.status = SessionStatus::Ended;
        self.winner = Some(self.participant(seat).to_owned());
        self.disconnection = None;
        self.touch(now);
    }

    /// Queue a system message for the next broadcast.
    pub fn queue_system_message(&mut self, message: impl Into<String>) {
        self.pending_system_messages.push(message.into());
    }

    /// Check structural consistency of the record.
    pub fn validate(&self) -> Result<(), SessionFault> {
        if self.participants.iter().any(|p| p.trim().is_empty()) {
            return Err(SessionFault::EmptyParticipant { id: self.id });
        }
        if self.participants[0] == self.participants[1] {
            return Err(SessionFault::DuplicateParticipant { id: self.id });
        }
        Ok(())
    }

    /// Check that `next` is an acceptable successor of `self` produced by a processing step.
    pub fn check_successor(&self, next: &LiveSession) -> Result<(), SessionFault> {
        next.validate()?;
        if next.revision < self.revision {
            return Err(SessionFault::RevisionRegressed {
                id: self.id,
                before: self.revision,
                after: next.revision,
            });
        }
        if next.participants != self.participants {
            return Err(SessionFault::ParticipantsChanged { id: self.id });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_owner_follows_move_parity() {
        let mut session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 10);
        assert_eq!(session.turn_owner(), Seat::A);
        session.moves.push("e4".into());
        assert_eq!(session.turn_owner(), Seat::B);
    }

    #[test]
    fn touch_bumps_revision_and_never_rewinds_sync_time() {
        let mut session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 100);
        session.touch(90);
        assert_eq!(session.revision, 1);
        assert_eq!(session.last_synced_at, 100);
        session.touch(150);
        assert_eq!(session.revision, 2);
        assert_eq!(session.last_synced_at, 150);
    }

    #[test]
    fn practice_sessions_have_a_single_human() {
        let session = LiveSession::practice(Uuid::new_v4(), "ada", "bot:easy", 0);
        let humans: Vec<_> = session.human_participants().collect();
        assert_eq!(humans, vec!["ada"]);
    }

    #[test]
    fn successor_check_rejects_regressions() {
        let mut before = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        before.revision = 4;
        let mut after = before.clone();
        after.revision = 3;
        assert!(matches!(
            before.check_successor(&after),
            Err(SessionFault::RevisionRegressed { before: 4, after: 3, .. })
        ));

        let mut swapped = before.clone();
        swapped.participants.swap(0, 1);
        assert!(matches!(
            before.check_successor(&swapped),
            Err(SessionFault::ParticipantsChanged { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_seats() {
        let session = LiveSession::competitive(Uuid::new_v4(), "ada", "ada", 0);
        assert!(session.validate().is_err());
    }
}
