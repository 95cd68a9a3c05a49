//! The session simulation step: advance clocks and timeouts of a batch of sessions.

use futures::future::BoxFuture;

use crate::state::session::{LiveSession, SessionStatus, Timestamp};

/// Advances a batch of sessions to `now` and hands back the updated copies.
///
/// Implementations must keep the batch order and must bump `revision` on every mutation;
/// the reconciler rejects successors whose revision went backwards.
pub trait SessionSimulator: Send + Sync {
    /// Advance `sessions` to `now`.
    fn advance(&self, sessions: Vec<LiveSession>, now: Timestamp)
    -> BoxFuture<'static, Vec<LiveSession>>;
}

/// Rule-agnostic clock keeper.
///
/// An `in_progress` session whose turn deadline passed is lost by the player on turn; a
/// `scoring` session past its deadline becomes `ended`. Sessions in a grace window are
/// frozen until the lifecycle resolves them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnClockSimulator;

impl TurnClockSimulator {
    /// Advance one session in place; returns whether it changed.
    pub fn advance_one(session: &mut LiveSession, now: Timestamp) -> bool {
        let Some(deadline) = session.turn_deadline else {
            return false;
        };
        if now < deadline {
            return false;
        }

        match session.status {
            SessionStatus::InProgress => {
                let owner = session.turn_owner();
                let message = format!("{} ran out of time", session.participant(owner));
                session.queue_system_message(message);
                session.end_in_favor_of(owner.other(), now);
                true
            }
            SessionStatus::Scoring => {
                session.status = SessionStatus::Ended;
                session.turn_deadline = None;
                session.touch(now);
                true
            }
            _ => false,
        }
    }
}

impl SessionSimulator for TurnClockSimulator {
    fn advance(
        &self,
        mut sessions: Vec<LiveSession>,
        now: Timestamp,
    ) -> BoxFuture<'static, Vec<LiveSession>> {
        Box::pin(async move {
            for session in sessions.iter_mut() {
                Self::advance_one(session, now);
            }
            sessions
        })
    }
}
