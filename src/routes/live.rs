use axum::{
    Router,
    extract::{Path, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};

use crate::{services::websocket_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/users/{user_id}/live",
    tag = "live",
    params(("user_id" = String, Path, description = "User receiving session updates")),
    responses((status = 101, description = "Switching protocols to WebSocket"))
)]
/// Upgrade the HTTP connection into the user's live session update stream.
pub async fn live_socket(
    State(state): State<SharedState>,
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket_service::handle_socket(state, user_id, socket))
}

/// Configure the live update endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/users/{user_id}/live", get(live_socket))
}
