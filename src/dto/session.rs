use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationErrors};

use crate::{
    dto::{format_timestamp, validation::validate_user_id},
    state::{
        registry::ChatLine,
        session::{LiveSession, SessionKind, SessionStatus},
    },
};

/// Chat line as pushed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ChatLineDto {
    /// Author, absent for system messages.
    pub author: Option<String>,
    /// Message text.
    pub text: String,
    /// RFC 3339 timestamp.
    pub at: String,
}

impl From<ChatLine> for ChatLineDto {
    fn from(value: ChatLine) -> Self {
        Self {
            author: value.author,
            text: value.text,
            at: format_timestamp(value.at),
        }
    }
}

/// Participant currently inside a grace window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DisconnectionView {
    /// Absent participant.
    pub user_id: String,
    /// When the grace window opened.
    pub since: String,
    /// Whether the opponent may still void the session.
    pub claim_void_available: bool,
}

/// Snapshot of a session pushed to its participants and spectators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "type", rename = "session_update")]
pub struct SessionUpdate {
    /// Session identifier.
    pub session_id: Uuid,
    /// Competitive or practice.
    pub kind: SessionKind,
    /// Seat A then seat B.
    pub participants: Vec<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Authoritative revision.
    pub revision: u64,
    /// Ordered moves.
    pub moves: Vec<String>,
    /// Participant whose turn it is.
    pub turn_owner: String,
    /// Deadline of the current turn.
    pub turn_deadline: Option<String>,
    /// Winner, once decided.
    pub winner: Option<String>,
    /// Open grace window, if any.
    pub disconnection: Option<DisconnectionView>,
    /// Most recent chat lines.
    pub chat: Vec<ChatLineDto>,
}

impl SessionUpdate {
    /// Build the payload for `session` with its retained chat lines.
    pub fn from_session(session: &LiveSession, chat: Vec<ChatLine>) -> Self {
        Self {
            session_id: session.id,
            kind: session.kind,
            participants: session.participants.to_vec(),
            status: session.status,
            revision: session.revision,
            moves: session.moves.clone(),
            turn_owner: session.participant(session.turn_owner()).to_owned(),
            turn_deadline: session.turn_deadline.map(format_timestamp),
            winner: session.winner.clone(),
            disconnection: session.disconnection.as_ref().map(|d| DisconnectionView {
                user_id: session.participant(d.seat).to_owned(),
                since: format_timestamp(d.since),
                claim_void_available: d.claim_void_available,
            }),
            chat: chat.into_iter().map(ChatLineDto::from).collect(),
        }
    }
}

/// Body of `POST /sessions/{session_id}/claim-void`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ClaimVoidRequest {
    /// Present participant exercising the claim.
    pub user_id: String,
}

impl Validate for ClaimVoidRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Err(err) = validate_user_id(&self.user_id) {
            errors.add("user_id", err);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        registry::ChatLine,
        session::{DisconnectionState, Seat},
    };

    #[test]
    fn update_names_the_turn_owner_and_absent_player() {
        let mut session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        session.moves.push("e4".into());
        session.disconnection = Some(DisconnectionState {
            seat: Seat::A,
            since: 0,
            claim_void_available: true,
        });
        let chat = vec![ChatLine {
            author: None,
            text: "ada disconnected".into(),
            at: 0,
        }];

        let update = SessionUpdate::from_session(&session, chat);
        assert_eq!(update.turn_owner, "bob");
        assert_eq!(update.disconnection.unwrap().user_id, "ada");
        assert_eq!(update.chat.len(), 1);

        let json = serde_json::to_value(SessionUpdate::from_session(&session, Vec::new())).unwrap();
        assert_eq!(json["type"], "session_update");
    }

    #[test]
    fn claim_void_request_rejects_bad_user_ids() {
        let request = ClaimVoidRequest {
            user_id: "not valid".into(),
        };
        assert!(request.validate().is_err());
    }
}
