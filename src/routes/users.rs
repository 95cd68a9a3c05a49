use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use uuid::Uuid;

use crate::{
    dto::user::UserStateResponse, error::AppError, services::user_service, state::SharedState,
};

/// Presence endpoints of individual users.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/users/{user_id}/heartbeat", post(heartbeat))
        .route("/users/{user_id}/state", get(fetch_state))
        .route("/users/{user_id}/spectate/{session_id}", post(spectate))
        .route("/users/{user_id}/leave", post(leave_session))
}

/// Refresh the user's connection record.
#[utoipa::path(
    post,
    path = "/users/{user_id}/heartbeat",
    tag = "users",
    params(("user_id" = String, Path, description = "User sending the heartbeat")),
    responses(
        (status = 204, description = "Heartbeat recorded"),
        (status = 400, description = "Malformed user id")
    )
)]
pub async fn heartbeat(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    user_service::heartbeat(&state, &user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Current status, pending notice and negotiations of the user.
#[utoipa::path(
    get,
    path = "/users/{user_id}/state",
    tag = "users",
    params(("user_id" = String, Path, description = "User to describe")),
    responses(
        (status = 200, description = "Current user state", body = UserStateResponse)
    )
)]
pub async fn fetch_state(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStateResponse>, AppError> {
    Ok(Json(user_service::fetch_state(&state, &user_id)?))
}

/// Start watching a running session.
#[utoipa::path(
    post,
    path = "/users/{user_id}/spectate/{session_id}",
    tag = "users",
    params(
        ("user_id" = String, Path, description = "Spectating user"),
        ("session_id" = Uuid, Path, description = "Session to watch")
    ),
    responses(
        (status = 200, description = "User is now spectating", body = UserStateResponse),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "User is seated or the session is over")
    )
)]
pub async fn spectate(
    State(state): State<SharedState>,
    Path((user_id, session_id)): Path<(String, Uuid)>,
) -> Result<Json<UserStateResponse>, AppError> {
    Ok(Json(
        user_service::spectate(&state, &user_id, session_id).await?,
    ))
}

/// Stop spectating or step away from a finished session.
#[utoipa::path(
    post,
    path = "/users/{user_id}/leave",
    tag = "users",
    params(("user_id" = String, Path, description = "Leaving user")),
    responses(
        (status = 200, description = "User detached", body = UserStateResponse),
        (status = 409, description = "User is seated in a running session")
    )
)]
pub async fn leave_session(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserStateResponse>, AppError> {
    Ok(Json(user_service::leave_session(&state, &user_id)?))
}
