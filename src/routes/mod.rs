use axum::Router;

use crate::state::SharedState;

/// Swagger UI.
pub mod docs;
/// Health check.
pub mod health;
/// Live update WebSocket.
pub mod live;
/// Negotiation endpoints.
pub mod negotiations;
/// Session action endpoints.
pub mod sessions;
/// User presence endpoints.
pub mod users;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(users::router())
        .merge(sessions::router())
        .merge(negotiations::router())
        .merge(live::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
