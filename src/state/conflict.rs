use std::cmp::Ordering;

use crate::state::session::{LiveSession, Timestamp};

/// Which of two candidate copies of a session is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// The locally computed copy is at least as new and may be written.
    Local,
    /// The stored copy is strictly newer; the local update must be discarded.
    Stored,
}

/// Freshness key of a session: revision, then last sync time, then move count.
pub fn freshness(session: &LiveSession) -> (u64, Timestamp, usize) {
    (
        session.revision,
        session.last_synced_at,
        session.moves.len(),
    )
}

/// Order two copies of the same session by freshness.
pub fn compare(left: &LiveSession, right: &LiveSession) -> Ordering {
    freshness(left).cmp(&freshness(right))
}

/// Decide whether a locally computed update may overwrite the stored copy.
pub fn authoritative(local: &LiveSession, stored: &LiveSession) -> Authority {
    match compare(local, stored) {
        Ordering::Less => Authority::Stored,
        Ordering::Equal | Ordering::Greater => Authority::Local,
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn copy(revision: u64, synced: Timestamp, moves: usize) -> LiveSession {
        let mut session = LiveSession::competitive(Uuid::nil(), "ada", "bob", 0);
        session.revision = revision;
        session.last_synced_at = synced;
        session.moves = (0..moves).map(|i| format!("m{i}")).collect();
        session
    }

    #[test]
    fn higher_revision_wins_regardless_of_other_fields() {
        let local = copy(5, 100, 40);
        let stored = copy(6, 10, 0);
        assert_eq!(authoritative(&local, &stored), Authority::Stored);
        assert_eq!(authoritative(&stored, &local), Authority::Local);
    }

    #[test]
    fn equal_revision_falls_back_to_sync_time() {
        let local = copy(3, 200, 0);
        let stored = copy(3, 250, 0);
        assert_eq!(authoritative(&local, &stored), Authority::Stored);
        assert_eq!(authoritative(&stored, &local), Authority::Local);
    }

    #[test]
    fn equal_revision_and_sync_time_fall_back_to_move_count() {
        let local = copy(3, 200, 7);
        let stored = copy(3, 200, 8);
        assert_eq!(authoritative(&local, &stored), Authority::Stored);
        assert_eq!(authoritative(&stored, &local), Authority::Local);
    }

    #[test]
    fn full_tie_keeps_the_local_copy() {
        let local = copy(3, 200, 8);
        let stored = local.clone();
        assert_eq!(authoritative(&local, &stored), Authority::Local);
    }

    #[test]
    fn order_is_total_and_antisymmetric() {
        let copies = [copy(1, 5, 2), copy(1, 5, 3), copy(1, 6, 0), copy(2, 0, 0)];
        for (i, a) in copies.iter().enumerate() {
            for (j, b) in copies.iter().enumerate() {
                assert_eq!(compare(a, b), i.cmp(&j));
            }
        }
    }
}
