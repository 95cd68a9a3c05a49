use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use uuid::Uuid;

use crate::{
    dto::session::{ClaimVoidRequest, SessionUpdate},
    error::AppError,
    services::user_service,
    state::SharedState,
};

/// Player actions on live sessions.
pub fn router() -> Router<SharedState> {
    Router::new().route("/sessions/{session_id}/claim-void", post(claim_void))
}

/// Void a session while the opponent is away and the claim right is open.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/claim-void",
    tag = "sessions",
    params(("session_id" = Uuid, Path, description = "Session to void")),
    request_body = ClaimVoidRequest,
    responses(
        (status = 200, description = "Session voided", body = SessionUpdate),
        (status = 403, description = "Caller does not play in the session"),
        (status = 409, description = "No claim-void right is open")
    )
)]
pub async fn claim_void(
    State(state): State<SharedState>,
    Path(session_id): Path<Uuid>,
    Json(payload): Json<ClaimVoidRequest>,
) -> Result<Json<SessionUpdate>, AppError> {
    Ok(Json(
        user_service::claim_void(&state, session_id, payload).await?,
    ))
}
