//! Challenge and rematch offers between two users.
//!
//! Offers live in the negotiation table until their deadline; expiry is handled by the
//! reconciliation tick. Answered offers stay in the table (no longer binding anyone) until then.

use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dto::negotiation::{NegotiationView, OpenNegotiationRequest, RespondNegotiationRequest},
    error::ServiceError,
    services::user_service::{find_session, heartbeat},
    state::{
        SharedState,
        registry::{
            Negotiation, NegotiationKind, NegotiationStatus, PresenceStatus, UserStatus,
        },
    },
};

fn mark_negotiating(state: &SharedState, user: &str) {
    let statuses = &state.registry().statuses;
    statuses.get_or_insert(user, UserStatus::waiting());
    statuses.update(user, |entry| {
        entry.status = PresenceStatus::Negotiating;
        entry.spectating = None;
    });
}

fn ensure_available(state: &SharedState, user: &str) -> Result<(), ServiceError> {
    let seated = state
        .registry()
        .statuses
        .get(user)
        .is_some_and(|status| status.status == PresenceStatus::InGame);
    if seated {
        return Err(ServiceError::InvalidState(format!(
            "`{user}` is seated in a running session"
        )));
    }
    Ok(())
}

/// Open a challenge or rematch offer from `request.from` to `request.to`.
pub async fn open_negotiation(
    state: &SharedState,
    request: OpenNegotiationRequest,
) -> Result<NegotiationView, ServiceError> {
    request.validate()?;
    heartbeat(state, &request.from)?;

    let registry = state.registry();
    if !registry.connections.is_connected(&request.to) {
        return Err(ServiceError::InvalidState(format!(
            "`{}` is not online",
            request.to
        )));
    }
    ensure_available(state, &request.from)?;
    ensure_available(state, &request.to)?;

    let now = state.now();
    let duplicate = registry
        .negotiations
        .involving(&request.from)
        .iter()
        .any(|offer| offer.involves(&request.to) && offer.is_pending(now));
    if duplicate {
        return Err(ServiceError::InvalidState(
            "an offer between these users is already pending".into(),
        ));
    }

    if request.kind == NegotiationKind::Rematch {
        let source = request
            .source_session
            .ok_or_else(|| ServiceError::InvalidInput("rematch without a source session".into()))?;
        let session = find_session(state, source).await?;
        if !session.status.is_terminal() {
            return Err(ServiceError::InvalidState(format!(
                "session `{source}` is still running"
            )));
        }
        if session.seat_of(&request.from).is_none() || session.seat_of(&request.to).is_none() {
            return Err(ServiceError::Forbidden(
                "a rematch can only be offered between the players of the finished session".into(),
            ));
        }
    }

    let negotiation = Negotiation {
        id: Uuid::new_v4(),
        kind: request.kind,
        from: request.from,
        to: request.to,
        source_session: request.source_session,
        deadline: now.saturating_add(request.ttl_ms),
        status: NegotiationStatus::Pending,
    };
    registry.negotiations.insert(negotiation.clone());
    mark_negotiating(state, &negotiation.from);
    mark_negotiating(state, &negotiation.to);

    info!(
        negotiation_id = %negotiation.id,
        from = %negotiation.from,
        to = %negotiation.to,
        kind = ?negotiation.kind,
        "negotiation opened"
    );
    Ok(negotiation.into())
}

/// Accept or reject a pending offer. Only its recipient may answer.
pub fn respond_to_negotiation(
    state: &SharedState,
    id: Uuid,
    request: RespondNegotiationRequest,
) -> Result<NegotiationView, ServiceError> {
    request.validate()?;
    heartbeat(state, &request.user_id)?;

    let registry = state.registry();
    let now = state.now();
    let offer = registry
        .negotiations
        .get(id)
        .ok_or_else(|| ServiceError::NotFound(format!("negotiation `{id}` not found")))?;
    if offer.to != request.user_id {
        return Err(ServiceError::Forbidden(
            "only the recipient can answer an offer".into(),
        ));
    }
    if !offer.is_pending(now) {
        return Err(ServiceError::InvalidState(format!(
            "negotiation `{id}` is no longer pending"
        )));
    }

    let status = if request.accept {
        NegotiationStatus::Accepted
    } else {
        NegotiationStatus::Rejected
    };
    let answered = registry
        .negotiations
        .update(id, |offer| offer.status = status)
        .ok_or_else(|| ServiceError::NotFound(format!("negotiation `{id}` not found")))?;

    if status == NegotiationStatus::Rejected {
        for user in [&answered.from, &answered.to] {
            if !registry.negotiations.binds(user, now) {
                registry.statuses.release_from_negotiation(user);
            }
        }
    }

    info!(negotiation_id = %id, status = ?status, "negotiation answered");
    Ok(answered.into())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::ReconcilerConfig,
        dao::session_store::InMemorySessionStore,
        state::{
            AppState,
            session::{LiveSession, SessionStatus},
        },
    };

    async fn online_state(users: &[&str]) -> SharedState {
        let state = AppState::new(ReconcilerConfig::default());
        state
            .install_session_store(Arc::new(InMemorySessionStore::new()))
            .await;
        for user in users {
            heartbeat(&state, user).unwrap();
        }
        state
    }

    fn challenge(from: &str, to: &str) -> OpenNegotiationRequest {
        OpenNegotiationRequest {
            from: from.into(),
            to: to.into(),
            kind: NegotiationKind::Challenge,
            source_session: None,
            ttl_ms: 30_000,
        }
    }

    fn answer(user: &str, accept: bool) -> RespondNegotiationRequest {
        RespondNegotiationRequest {
            user_id: user.into(),
            accept,
        }
    }

    fn presence(state: &SharedState, user: &str) -> PresenceStatus {
        state.registry().statuses.get(user).unwrap().status
    }

    #[tokio::test]
    async fn opening_marks_both_parties_negotiating() {
        let state = online_state(&["ada", "bob"]).await;
        let view = open_negotiation(&state, challenge("ada", "bob")).await.unwrap();

        assert_eq!(view.status, NegotiationStatus::Pending);
        assert_eq!(presence(&state, "ada"), PresenceStatus::Negotiating);
        assert_eq!(presence(&state, "bob"), PresenceStatus::Negotiating);
        assert!(matches!(
            open_negotiation(&state, challenge("bob", "ada")).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn offline_or_seated_users_cannot_be_challenged() {
        let state = online_state(&["ada", "bob"]).await;
        assert!(matches!(
            open_negotiation(&state, challenge("ada", "zed")).await,
            Err(ServiceError::InvalidState(_))
        ));

        state.registry().statuses.seat("bob", Uuid::new_v4());
        assert!(matches!(
            open_negotiation(&state, challenge("ada", "bob")).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn rejection_releases_parties_not_bound_elsewhere() {
        let state = online_state(&["ada", "bob", "cid"]).await;
        let first = open_negotiation(&state, challenge("ada", "bob")).await.unwrap();
        open_negotiation(&state, challenge("cid", "ada")).await.unwrap();

        assert!(matches!(
            respond_to_negotiation(&state, first.id, answer("ada", false)),
            Err(ServiceError::Forbidden(_))
        ));
        let rejected = respond_to_negotiation(&state, first.id, answer("bob", false)).unwrap();

        assert_eq!(rejected.status, NegotiationStatus::Rejected);
        assert_eq!(presence(&state, "bob"), PresenceStatus::Waiting);
        assert_eq!(presence(&state, "ada"), PresenceStatus::Negotiating);
        assert!(matches!(
            respond_to_negotiation(&state, first.id, answer("bob", true)),
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn acceptance_keeps_parties_negotiating() {
        let state = online_state(&["ada", "bob"]).await;
        let offer = open_negotiation(&state, challenge("ada", "bob")).await.unwrap();

        let accepted = respond_to_negotiation(&state, offer.id, answer("bob", true)).unwrap();

        assert_eq!(accepted.status, NegotiationStatus::Accepted);
        assert_eq!(presence(&state, "bob"), PresenceStatus::Negotiating);
        assert!(matches!(
            respond_to_negotiation(&state, Uuid::new_v4(), answer("bob", true)),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rematch_requires_a_finished_shared_session() {
        let state = online_state(&["ada", "bob", "cid"]).await;
        let mut finished = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        finished.status = SessionStatus::Ended;
        let running = LiveSession::competitive(Uuid::new_v4(), "ada", "cid", 0);
        state.cache().put(finished.clone(), state.now());
        state.cache().put(running.clone(), state.now());

        let rematch = |from: &str, to: &str, source| OpenNegotiationRequest {
            kind: NegotiationKind::Rematch,
            source_session: Some(source),
            ..challenge(from, to)
        };

        assert!(matches!(
            open_negotiation(&state, rematch("ada", "cid", running.id)).await,
            Err(ServiceError::InvalidState(_))
        ));
        assert!(matches!(
            open_negotiation(&state, rematch("cid", "bob", finished.id)).await,
            Err(ServiceError::Forbidden(_))
        ));
        let offer = open_negotiation(&state, rematch("ada", "bob", finished.id))
            .await
            .unwrap();
        assert_eq!(offer.source_session, Some(finished.id));
        assert!(
            state
                .registry()
                .negotiations
                .references_session(finished.id, state.now())
        );
    }
}
