use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Tabletop Live Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::users::heartbeat,
        crate::routes::users::fetch_state,
        crate::routes::users::spectate,
        crate::routes::users::leave_session,
        crate::routes::sessions::claim_void,
        crate::routes::negotiations::open_negotiation,
        crate::routes::negotiations::respond_to_negotiation,
        crate::routes::live::live_socket,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::user::UserStateResponse,
            crate::dto::session::SessionUpdate,
            crate::dto::session::ClaimVoidRequest,
            crate::dto::session::ChatLineDto,
            crate::dto::session::DisconnectionView,
            crate::dto::negotiation::OpenNegotiationRequest,
            crate::dto::negotiation::RespondNegotiationRequest,
            crate::dto::negotiation::NegotiationView,
            crate::state::registry::PresenceStatus,
            crate::state::registry::NegotiationKind,
            crate::state::registry::NegotiationStatus,
            crate::state::session::SessionKind,
            crate::state::session::SessionStatus,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "users", description = "Presence, heartbeats and spectating"),
        (name = "sessions", description = "Player actions on live sessions"),
        (name = "negotiations", description = "Challenge and rematch offers"),
        (name = "live", description = "WebSocket stream of session updates"),
    )
)]
pub struct ApiDoc;
