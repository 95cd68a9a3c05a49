use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    dto::{format_timestamp, validation::validate_user_id},
    state::registry::{Negotiation, NegotiationKind, NegotiationStatus},
};

const MIN_TTL_MS: u64 = 1_000;
const MAX_TTL_MS: u64 = 10 * 60 * 1_000;

/// Body of `POST /negotiations`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct OpenNegotiationRequest {
    /// Offering user.
    pub from: String,
    /// Receiving user.
    pub to: String,
    /// Challenge or rematch.
    pub kind: NegotiationKind,
    /// Finished session a rematch refers to.
    #[serde(default)]
    pub source_session: Option<Uuid>,
    /// Lifetime of the offer in milliseconds.
    pub ttl_ms: u64,
}

impl Validate for OpenNegotiationRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if let Err(err) = validate_user_id(&self.from) {
            errors.add("from", err);
        }
        if let Err(err) = validate_user_id(&self.to) {
            errors.add("to", err);
        }
        if self.from == self.to {
            let mut err = ValidationError::new("self_negotiation");
            err.message = Some("A user cannot negotiate with themselves".into());
            errors.add("to", err);
        }
        if self.kind == NegotiationKind::Rematch && self.source_session.is_none() {
            let mut err = ValidationError::new("rematch_source");
            err.message = Some("A rematch must reference the finished session".into());
            errors.add("source_session", err);
        }
        if !(MIN_TTL_MS..=MAX_TTL_MS).contains(&self.ttl_ms) {
            let mut err = ValidationError::new("ttl_range");
            err.message =
                Some(format!("ttl_ms must be between {MIN_TTL_MS} and {MAX_TTL_MS}").into());
            errors.add("ttl_ms", err);
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Body of `POST /negotiations/{negotiation_id}/respond`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RespondNegotiationRequest {
    /// Recipient answering the offer.
    pub user_id: String,
    /// Accept or reject.
    pub accept: bool,
}

impl Validate for RespondNegotiationRequest {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if let Err(err) = validate_user_id(&self.user_id) {
            errors.add("user_id", err);
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Offer as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct NegotiationView {
    /// Identifier.
    pub id: Uuid,
    /// Challenge or rematch.
    pub kind: NegotiationKind,
    /// Offering user.
    pub from: String,
    /// Receiving user.
    pub to: String,
    /// Finished session a rematch refers to.
    pub source_session: Option<Uuid>,
    /// RFC 3339 deadline.
    pub deadline: String,
    /// Current state.
    pub status: NegotiationStatus,
}

impl From<Negotiation> for NegotiationView {
    fn from(value: Negotiation) -> Self {
        Self {
            id: value.id,
            kind: value.kind,
            from: value.from,
            to: value.to,
            source_session: value.source_session,
            deadline: format_timestamp(value.deadline),
            status: value.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> OpenNegotiationRequest {
        OpenNegotiationRequest {
            from: "ada".into(),
            to: "bob".into(),
            kind: NegotiationKind::Challenge,
            source_session: None,
            ttl_ms: 30_000,
        }
    }

    #[test]
    fn accepts_a_plain_challenge() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn rejects_self_challenges_and_short_ttls() {
        let mut invalid = request();
        invalid.to = "ada".into();
        invalid.ttl_ms = 10;
        let errors = invalid.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("to"));
        assert!(fields.contains_key("ttl_ms"));
    }

    #[test]
    fn rematch_requires_a_source_session() {
        let mut rematch = request();
        rematch.kind = NegotiationKind::Rematch;
        assert!(rematch.validate().is_err());
        rematch.source_session = Some(Uuid::new_v4());
        assert!(rematch.validate().is_ok());
    }
}
