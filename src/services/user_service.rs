//! Request paths of individual users: heartbeats, state fetches, spectating and the
//! claim-void right granted during a grace window.

use futures::future::BoxFuture;
use tracing::{info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dao::storage::StorageResult,
    dto::{
        negotiation::NegotiationView,
        session::{ClaimVoidRequest, SessionUpdate},
        user::UserStateResponse,
        validation::validate_user_id,
    },
    error::ServiceError,
    services::{
        gateway::BroadcastGateway,
        health_guard::{Bounded, with_deadline},
    },
    state::{
        SharedState,
        registry::{PresenceStatus, UserStatus},
        session::{LiveSession, SessionId, SessionStatus},
    },
};

pub(crate) fn ensure_user_id(user: &str) -> Result<(), ServiceError> {
    validate_user_id(user).map_err(|err| {
        ServiceError::InvalidInput(
            err.message
                .map(|message| message.into_owned())
                .unwrap_or_else(|| format!("invalid user id `{user}`")),
        )
    })
}

/// Await a storage call under the configured I/O deadline.
pub(crate) async fn call_store<T>(
    state: &SharedState,
    call: BoxFuture<'static, StorageResult<T>>,
) -> Result<T, ServiceError> {
    match with_deadline(state.config().io_deadline(), call).await {
        Bounded::Answered(result) => result.map_err(ServiceError::from),
        Bounded::TimedOut => Err(ServiceError::Timeout),
    }
}

/// Read-through lookup: fresh cache entry first, then the store.
pub(crate) async fn find_session(
    state: &SharedState,
    id: SessionId,
) -> Result<LiveSession, ServiceError> {
    let now = state.now();
    if let Some(session) = state.cache().get(id, now) {
        return Ok(session);
    }

    let store = state.require_session_store().await?;
    let session = call_store(state, store.load_session(id))
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{id}` not found")))?;
    state.cache().put(session.clone(), now);
    Ok(session)
}

fn pending_negotiations(state: &SharedState, user: &str) -> Vec<NegotiationView> {
    let now = state.now();
    state
        .registry()
        .negotiations
        .involving(user)
        .into_iter()
        .filter(|negotiation| negotiation.is_pending(now))
        .map(NegotiationView::from)
        .collect()
}

fn current_status(state: &SharedState, user: &str) -> UserStatus {
    state
        .registry()
        .statuses
        .get_or_insert(user, UserStatus::waiting())
}

/// Refresh the connection record of `user`, creating a waiting status on first contact.
pub fn heartbeat(state: &SharedState, user: &str) -> Result<(), ServiceError> {
    ensure_user_id(user)?;
    let registry = state.registry();
    registry.connections.touch(user, state.now());
    registry.statuses.get_or_insert(user, UserStatus::waiting());
    Ok(())
}

/// Current view of `user`. A pending abandonment notice is handed out once and dropped.
pub fn fetch_state(state: &SharedState, user: &str) -> Result<UserStateResponse, ServiceError> {
    heartbeat(state, user)?;
    let notice = state.registry().notices.take(user);
    Ok(UserStateResponse::new(
        user,
        current_status(state, user),
        notice,
        pending_negotiations(state, user),
    ))
}

/// Start watching `session_id`.
pub async fn spectate(
    state: &SharedState,
    user: &str,
    session_id: Uuid,
) -> Result<UserStateResponse, ServiceError> {
    heartbeat(state, user)?;

    let current = current_status(state, user);
    if current.status == PresenceStatus::InGame {
        return Err(ServiceError::InvalidState(
            "players cannot spectate while seated in a session".into(),
        ));
    }

    let session = find_session(state, session_id).await?;
    if session.seat_of(user).is_some() {
        return Err(ServiceError::InvalidInput(
            "participants cannot spectate their own session".into(),
        ));
    }
    if session.status.is_terminal() {
        return Err(ServiceError::InvalidState(format!(
            "session `{session_id}` is already over"
        )));
    }

    let status = UserStatus {
        status: PresenceStatus::Spectating,
        session_id: None,
        spectating: Some(session_id),
    };
    state.registry().statuses.set(user, status.clone());
    Ok(UserStateResponse::new(
        user,
        status,
        None,
        pending_negotiations(state, user),
    ))
}

/// Stop watching, or step away from a finished session.
///
/// A running session cannot be left this way; absence is resolved by the disconnect lifecycle.
pub fn leave_session(state: &SharedState, user: &str) -> Result<UserStateResponse, ServiceError> {
    heartbeat(state, user)?;

    let current = current_status(state, user);
    if current.status == PresenceStatus::InGame {
        return Err(ServiceError::InvalidState(
            "a running session cannot be left".into(),
        ));
    }

    state.registry().statuses.update(user, |entry| {
        entry.session_id = None;
        entry.spectating = None;
        if entry.status == PresenceStatus::Spectating {
            entry.status = PresenceStatus::Waiting;
        }
    });

    Ok(UserStateResponse::new(
        user,
        current_status(state, user),
        None,
        pending_negotiations(state, user),
    ))
}

/// Void `session_id` on behalf of the present participant while the opponent is in grace.
pub async fn claim_void(
    state: &SharedState,
    session_id: Uuid,
    request: ClaimVoidRequest,
) -> Result<SessionUpdate, ServiceError> {
    request.validate()?;
    let user = request.user_id;
    heartbeat(state, &user)?;

    let store = state.require_session_store().await?;
    let mut session = call_store(state, store.load_session(session_id))
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{session_id}` not found")))?;

    let Some(seat) = session.seat_of(&user) else {
        return Err(ServiceError::Forbidden(format!(
            "`{user}` does not play in session `{session_id}`"
        )));
    };
    let claimable = session.status == SessionStatus::DisconnectGrace
        && session
            .disconnection
            .as_ref()
            .is_some_and(|grace| grace.seat != seat && grace.claim_void_available);
    if !claimable {
        return Err(ServiceError::InvalidState(
            "no claim-void right is available for this session".into(),
        ));
    }

    let now = state.now();
    session.status = SessionStatus::NoContest;
    session.disconnection = None;
    session.turn_deadline = None;
    session.winner = None;
    session.touch(now);
    let messages = vec![format!("{user} voided the game after the opponent left")];

    call_store(state, store.save_session(session.clone())).await?;
    state.cache().put(session.clone(), now);
    info!(session_id = %session_id, user_id = %user, "session voided by claim");

    let registry = state.registry();
    registry.chat.append_system(session_id, messages, now);
    for participant in session.human_participants() {
        registry.statuses.finish_session(participant, session_id);
    }

    let spectators: Vec<String> = registry
        .statuses
        .spectators_of(session_id)
        .into_iter()
        .filter(|spectator| registry.connections.is_connected(spectator))
        .collect();
    let update = SessionUpdate::from_session(&session, registry.chat.recent(session_id));
    let reached = state
        .gateway()
        .broadcast_to_participants(&session, &spectators, &update);
    if reached == 0 {
        warn!(session_id = %session_id, "voided session had no subscriber to notify");
    }

    Ok(update)
}
