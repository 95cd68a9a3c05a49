use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use uuid::Uuid;

use crate::{
    dto::negotiation::{NegotiationView, OpenNegotiationRequest, RespondNegotiationRequest},
    error::AppError,
    services::negotiation_service,
    state::SharedState,
};

/// Challenge and rematch offers.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/negotiations", post(open_negotiation))
        .route(
            "/negotiations/{negotiation_id}/respond",
            post(respond_to_negotiation),
        )
}

/// Offer a challenge or a rematch to another online user.
#[utoipa::path(
    post,
    path = "/negotiations",
    tag = "negotiations",
    request_body = OpenNegotiationRequest,
    responses(
        (status = 200, description = "Offer opened", body = NegotiationView),
        (status = 400, description = "Invalid offer"),
        (status = 409, description = "A party is unavailable")
    )
)]
pub async fn open_negotiation(
    State(state): State<SharedState>,
    Json(payload): Json<OpenNegotiationRequest>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(
        negotiation_service::open_negotiation(&state, payload).await?,
    ))
}

/// Accept or reject a pending offer.
#[utoipa::path(
    post,
    path = "/negotiations/{negotiation_id}/respond",
    tag = "negotiations",
    params(("negotiation_id" = Uuid, Path, description = "Offer to answer")),
    request_body = RespondNegotiationRequest,
    responses(
        (status = 200, description = "Offer answered", body = NegotiationView),
        (status = 403, description = "Caller is not the recipient"),
        (status = 404, description = "Unknown or expired offer")
    )
)]
pub async fn respond_to_negotiation(
    State(state): State<SharedState>,
    Path(negotiation_id): Path<Uuid>,
    Json(payload): Json<RespondNegotiationRequest>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(negotiation_service::respond_to_negotiation(
        &state,
        negotiation_id,
        payload,
    )?))
}
