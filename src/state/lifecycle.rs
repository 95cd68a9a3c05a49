//! Disconnect / reconnect state machine applied to each live session per tick.
//!
//! Per participant the machine is `connected -> grace_pending -> connected | resolved`.
//! Practice sessions are never penalised. When neither participant nor any spectator is
//! present the session is abandoned outright, which is a terminal transition of its own.

use crate::{
    config::ReconcilerConfig,
    state::session::{
        DisconnectionState, LiveSession, Seat, SessionKind, SessionStatus, Timestamp,
    },
};

/// Who is currently around a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Presence {
    /// Whether the participant at each seat has a live connection record.
    pub seats: [bool; 2],
    /// Connected spectators of the session.
    pub spectators: usize,
}

impl Presence {
    /// Whether the participant at `seat` is present.
    pub fn is_present(&self, seat: Seat) -> bool {
        self.seats[seat.index()]
    }

    fn nobody(&self) -> bool {
        !self.seats[0] && !self.seats[1] && self.spectators == 0
    }
}

/// Tunables of the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    /// Time an absent participant has to come back.
    pub grace_window_ms: u64,
    /// Timeout count at which the participant forfeits without a grace window.
    pub max_disconnections: u32,
    /// Sessions with fewer moves grant the present opponent a claim-void right.
    pub claim_void_move_threshold: usize,
}

impl From<&ReconcilerConfig> for LifecyclePolicy {
    fn from(config: &ReconcilerConfig) -> Self {
        Self {
            grace_window_ms: config.grace_window_ms,
            max_disconnections: config.max_disconnections,
            claim_void_move_threshold: config.claim_void_move_threshold,
        }
    }
}

/// Why a participant lost by disconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForfeitReason {
    /// The grace window elapsed without a reconnect.
    GraceExpired,
    /// The participant hit the disconnect limit.
    RepeatedDisconnect,
}

/// Outcome of evaluating a session against the current presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing to do.
    Unchanged,
    /// Nobody is left; the session must be deleted and both participants notified.
    MutualAbandonment,
    /// A grace window opened for `seat`.
    GraceStarted {
        /// Absent seat.
        seat: Seat,
        /// Whether the opponent may void the session.
        claim_void_available: bool,
    },
    /// The participant at `seat` came back in time.
    Reconnected {
        /// Returning seat.
        seat: Seat,
    },
    /// The participant at `seat` lost the session.
    Forfeited {
        /// Losing seat.
        seat: Seat,
        /// Cause of the loss.
        reason: ForfeitReason,
    },
}

/// Decide the transition of `session` without mutating it.
pub fn evaluate(
    session: &LiveSession,
    presence: &Presence,
    now: Timestamp,
    policy: &LifecyclePolicy,
) -> Transition {
    if session.status.is_terminal() || session.kind == SessionKind::Practice {
        return Transition::Unchanged;
    }

    if presence.nobody() {
        return Transition::MutualAbandonment;
    }

    if let Some(grace) = &session.disconnection {
        if presence.is_present(grace.seat) {
            return Transition::Reconnected { seat: grace.seat };
        }
        if now >= grace.since.saturating_add(policy.grace_window_ms) {
            return Transition::Forfeited {
                seat: grace.seat,
                reason: ForfeitReason::GraceExpired,
            };
        }
        return Transition::Unchanged;
    }

    if session.status != SessionStatus::InProgress {
        return Transition::Unchanged;
    }

    let Some(seat) = absent_seat(session, presence) else {
        return Transition::Unchanged;
    };

    let timeouts = session.disconnection_counts[seat.index()] + 1;
    if timeouts >= policy.max_disconnections {
        Transition::Forfeited {
            seat,
            reason: ForfeitReason::RepeatedDisconnect,
        }
    } else {
        Transition::GraceStarted {
            seat,
            claim_void_available: session.moves.len() < policy.claim_void_move_threshold,
        }
    }
}

/// Apply `transition` to `session`. Mutual abandonment leaves the record untouched.
pub fn apply(session: &mut LiveSession, transition: Transition, now: Timestamp, policy: &LifecyclePolicy) {
    match transition {
        Transition::Unchanged | Transition::MutualAbandonment => {}
        Transition::GraceStarted {
            seat,
            claim_void_available,
        } => {
            session.disconnection_counts[seat.index()] += 1;
            session.status = SessionStatus::DisconnectGrace;
            session.disconnection = Some(DisconnectionState {
                seat,
                since: now,
                claim_void_available,
            });
            let message = format!(
                "{} disconnected; waiting {}s for a reconnect",
                session.participant(seat),
                policy.grace_window_ms / 1_000
            );
            session.queue_system_message(message);
            session.touch(now);
        }
        Transition::Reconnected { seat } => {
            if let Some(grace) = session.disconnection.take() {
                let paused = now.saturating_sub(grace.since);
                session.turn_deadline = session
                    .turn_deadline
                    .map(|deadline| deadline.saturating_add(paused));
            }
            session.status = SessionStatus::InProgress;
            let message = format!("{} reconnected", session.participant(seat));
            session.queue_system_message(message);
            session.touch(now);
        }
        Transition::Forfeited { seat, reason } => {
            if reason == ForfeitReason::RepeatedDisconnect {
                session.disconnection_counts[seat.index()] += 1;
            }
            let message = match reason {
                ForfeitReason::GraceExpired => {
                    format!("{} did not reconnect in time", session.participant(seat))
                }
                ForfeitReason::RepeatedDisconnect => {
                    format!("{} disconnected too many times", session.participant(seat))
                }
            };
            session.queue_system_message(message);
            session.end_in_favor_of(seat.other(), now);
        }
    }
}

/// Evaluate and apply in one step, returning the transition taken.
pub fn reconcile_presence(
    session: &mut LiveSession,
    presence: &Presence,
    now: Timestamp,
    policy: &LifecyclePolicy,
) -> Transition {
    let transition = evaluate(session, presence, now, policy);
    apply(session, transition, now, policy);
    transition
}

/// Seat that should enter grace. With both seats empty but a spectator watching, the seat
/// on turn is picked so the clock owner answers for the stall.
fn absent_seat(session: &LiveSession, presence: &Presence) -> Option<Seat> {
    let owner = session.turn_owner();
    [owner, owner.other()]
        .into_iter()
        .find(|seat| !presence.is_present(*seat))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    const POLICY: LifecyclePolicy = LifecyclePolicy {
        grace_window_ms: 60_000,
        max_disconnections: 3,
        claim_void_move_threshold: 2,
    };

    fn playing() -> LiveSession {
        let mut session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        session.status = SessionStatus::InProgress;
        session.turn_deadline = Some(100_000);
        session
    }

    fn present(a: bool, b: bool) -> Presence {
        Presence {
            seats: [a, b],
            spectators: 0,
        }
    }

    #[test]
    fn everyone_present_is_a_no_op() {
        let mut session = playing();
        let before = session.clone();
        let transition = reconcile_presence(&mut session, &present(true, true), 1_000, &POLICY);
        assert_eq!(transition, Transition::Unchanged);
        assert_eq!(session, before);
    }

    #[test]
    fn first_timeout_opens_grace_with_claim_void_on_short_games() {
        let mut session = playing();
        let transition = reconcile_presence(&mut session, &present(true, false), 1_000, &POLICY);
        assert_eq!(
            transition,
            Transition::GraceStarted {
                seat: Seat::B,
                claim_void_available: true
            }
        );
        assert_eq!(session.status, SessionStatus::DisconnectGrace);
        assert_eq!(session.disconnection_counts, [0, 1]);
        assert_eq!(session.revision, 1);
        assert_eq!(session.pending_system_messages.len(), 1);
    }

    #[test]
    fn long_games_do_not_grant_claim_void() {
        let mut session = playing();
        session.moves = vec!["a".into(), "b".into(), "c".into()];
        let transition = evaluate(&session, &present(false, true), 1_000, &POLICY);
        assert_eq!(
            transition,
            Transition::GraceStarted {
                seat: Seat::A,
                claim_void_available: false
            }
        );
    }

    #[test]
    fn reconnect_inside_the_window_restores_play_and_pauses_the_clock() {
        let mut session = playing();
        reconcile_presence(&mut session, &present(true, false), 10_000, &POLICY);
        let transition = reconcile_presence(&mut session, &present(true, true), 40_000, &POLICY);

        assert_eq!(transition, Transition::Reconnected { seat: Seat::B });
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(session.disconnection.is_none());
        assert_eq!(session.turn_deadline, Some(130_000));
        assert_eq!(session.revision, 2);
        assert!(session.winner.is_none());
    }

    #[test]
    fn still_absent_inside_the_window_waits() {
        let mut session = playing();
        reconcile_presence(&mut session, &present(true, false), 10_000, &POLICY);
        let transition = reconcile_presence(&mut session, &present(true, false), 69_999, &POLICY);
        assert_eq!(transition, Transition::Unchanged);
        assert_eq!(session.status, SessionStatus::DisconnectGrace);
    }

    #[test]
    fn grace_expiry_ends_the_session_for_the_opponent() {
        let mut session = playing();
        reconcile_presence(&mut session, &present(true, false), 10_000, &POLICY);
        let transition = reconcile_presence(&mut session, &present(true, false), 70_000, &POLICY);

        assert_eq!(
            transition,
            Transition::Forfeited {
                seat: Seat::B,
                reason: ForfeitReason::GraceExpired
            }
        );
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(session.winner.as_deref(), Some("ada"));
    }

    #[test]
    fn third_timeout_forfeits_without_grace() {
        let mut session = playing();
        session.disconnection_counts = [2, 0];
        let transition = reconcile_presence(&mut session, &present(false, true), 5_000, &POLICY);

        assert_eq!(
            transition,
            Transition::Forfeited {
                seat: Seat::A,
                reason: ForfeitReason::RepeatedDisconnect
            }
        );
        assert_eq!(session.status, SessionStatus::Ended);
        assert_eq!(session.winner.as_deref(), Some("bob"));
        assert_eq!(session.disconnection_counts, [3, 0]);
        assert!(session.disconnection.is_none());
    }

    #[test]
    fn nobody_around_is_mutual_abandonment_even_during_grace() {
        let mut session = playing();
        reconcile_presence(&mut session, &present(true, false), 1_000, &POLICY);
        let before = session.clone();
        let transition = reconcile_presence(&mut session, &present(false, false), 2_000, &POLICY);
        assert_eq!(transition, Transition::MutualAbandonment);
        assert_eq!(session, before);
    }

    #[test]
    fn a_spectator_keeps_an_empty_table_alive() {
        let session = playing();
        let presence = Presence {
            seats: [false, false],
            spectators: 1,
        };
        assert_eq!(
            evaluate(&session, &presence, 1_000, &POLICY),
            Transition::GraceStarted {
                seat: Seat::A,
                claim_void_available: true
            }
        );
    }

    #[test]
    fn practice_sessions_are_never_penalised() {
        let mut session = LiveSession::practice(Uuid::new_v4(), "ada", "bot:easy", 0);
        session.status = SessionStatus::InProgress;
        assert_eq!(
            evaluate(&session, &present(false, false), 1_000, &POLICY),
            Transition::Unchanged
        );
    }

    #[test]
    fn waiting_sessions_do_not_enter_grace() {
        let mut session = playing();
        session.status = SessionStatus::Waiting;
        assert_eq!(
            evaluate(&session, &present(true, false), 1_000, &POLICY),
            Transition::Unchanged
        );
    }
}
