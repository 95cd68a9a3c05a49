use mongodb::bson::{Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::MongoDaoError;
use crate::state::session::{
    DisconnectionState, LiveSession, Seat, SessionKind, SessionStatus, Timestamp,
};

/// BSON has no unsigned 64-bit integer, so counters and timestamps are stored as `i64`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    id: String,
    kind: SessionKind,
    participants: [String; 2],
    moves: Vec<String>,
    status: SessionStatus,
    revision: i64,
    last_synced_at: i64,
    turn_deadline: Option<i64>,
    winner: Option<String>,
    disconnection: Option<MongoDisconnection>,
    disconnection_counts: [i64; 2],
    #[serde(default)]
    pending_system_messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MongoDisconnection {
    seat: Seat,
    since: i64,
    claim_void_available: bool,
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl From<&LiveSession> for MongoSessionDocument {
    fn from(value: &LiveSession) -> Self {
        Self {
            id: value.id.to_string(),
            kind: value.kind,
            participants: value.participants.clone(),
            moves: value.moves.clone(),
            status: value.status,
            revision: to_i64(value.revision),
            last_synced_at: to_i64(value.last_synced_at),
            turn_deadline: value.turn_deadline.map(to_i64),
            winner: value.winner.clone(),
            disconnection: value.disconnection.as_ref().map(|d| MongoDisconnection {
                seat: d.seat,
                since: to_i64(d.since),
                claim_void_available: d.claim_void_available,
            }),
            disconnection_counts: value.disconnection_counts.map(i64::from),
            pending_system_messages: value.pending_system_messages.clone(),
        }
    }
}

impl TryFrom<MongoSessionDocument> for LiveSession {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> Result<Self, Self::Error> {
        let corrupt = |reason: &str| MongoDaoError::Corrupt {
            id: value.id.clone(),
            reason: reason.to_owned(),
        };
        let unsigned = |field: i64, name: &str| -> Result<u64, MongoDaoError> {
            u64::try_from(field).map_err(|_| corrupt(&format!("negative `{name}`")))
        };
        let count = |field: i64| -> Result<u32, MongoDaoError> {
            u32::try_from(field).map_err(|_| corrupt("disconnection count out of range"))
        };

        let id = Uuid::parse_str(&value.id).map_err(|_| corrupt("`_id` is not a UUID"))?;
        let revision = unsigned(value.revision, "revision")?;
        let last_synced_at: Timestamp = unsigned(value.last_synced_at, "last_synced_at")?;
        let turn_deadline = value
            .turn_deadline
            .map(|deadline| unsigned(deadline, "turn_deadline"))
            .transpose()?;
        let disconnection = value
            .disconnection
            .as_ref()
            .map(|d| -> Result<DisconnectionState, MongoDaoError> {
                Ok(DisconnectionState {
                    seat: d.seat,
                    since: unsigned(d.since, "disconnection.since")?,
                    claim_void_available: d.claim_void_available,
                })
            })
            .transpose()?;
        let disconnection_counts = [
            count(value.disconnection_counts[0])?,
            count(value.disconnection_counts[1])?,
        ];

        Ok(LiveSession {
            id,
            kind: value.kind,
            participants: value.participants,
            moves: value.moves,
            status: value.status,
            revision,
            last_synced_at,
            turn_deadline,
            winner: value.winner,
            disconnection,
            disconnection_counts,
            pending_system_messages: value.pending_system_messages,
        })
    }
}

/// Filter selecting a session document by id.
pub fn doc_id(id: Uuid) -> Document {
    doc! {"_id": id.to_string()}
}

/// Wire names of the terminal session statuses.
pub fn terminal_statuses() -> Vec<String> {
    [SessionStatus::Ended, SessionStatus::NoContest]
        .iter()
        .filter_map(|status| serde_json::to_value(status).ok())
        .filter_map(|value| value.as_str().map(str::to_owned))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_preserves_every_field() {
        let mut session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 42);
        session.turn_deadline = Some(90);
        session.disconnection = Some(DisconnectionState {
            seat: Seat::B,
            since: 50,
            claim_void_available: true,
        });
        session.disconnection_counts = [0, 2];

        let document = MongoSessionDocument::from(&session);
        assert_eq!(LiveSession::try_from(document).unwrap(), session);
    }

    #[test]
    fn negative_revision_is_corrupt() {
        let session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        let mut document = MongoSessionDocument::from(&session);
        document.revision = -1;
        assert!(matches!(
            LiveSession::try_from(document),
            Err(MongoDaoError::Corrupt { .. })
        ));
    }

    #[test]
    fn terminal_statuses_match_wire_names() {
        assert_eq!(terminal_statuses(), vec!["ended", "no_contest"]);
    }
}
