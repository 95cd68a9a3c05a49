use crate::state::session::{LiveSession, SessionId, SessionStatus, Timestamp, UserId};

/// Cheap fingerprint of the observable fields of a session.
///
/// Two sessions with equal signatures are treated as identical by the reconciler:
/// neither a write nor a broadcast happens for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionSignature {
    id: SessionId,
    revision: u64,
    move_count: usize,
    status: SessionStatus,
    last_synced_at: Timestamp,
    turn_deadline: Option<Timestamp>,
    winner: Option<UserId>,
}

impl From<&LiveSession> for SessionSignature {
    fn from(session: &LiveSession) -> Self {
        Self {
            id: session.id,
            revision: session.revision,
            move_count: session.moves.len(),
            status: session.status,
            last_synced_at: session.last_synced_at,
            turn_deadline: session.turn_deadline,
            winner: session.winner.clone(),
        }
    }
}

/// Compute the signature of `session`.
pub fn signature(session: &LiveSession) -> SessionSignature {
    SessionSignature::from(session)
}
