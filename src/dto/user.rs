use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    dto::negotiation::NegotiationView,
    state::registry::{PresenceStatus, UserStatus},
};

/// Current view of a user returned by `GET /users/{user_id}/state`.
#[derive(Debug, Serialize, ToSchema)]
pub struct UserStateResponse {
    /// User identifier.
    pub user_id: String,
    /// Coarse activity.
    pub status: PresenceStatus,
    /// Session the user is seated in.
    pub session_id: Option<Uuid>,
    /// Session the user is watching.
    pub spectating: Option<Uuid>,
    /// One-shot notice, delivered at most once.
    pub notice: Option<String>,
    /// Offers the user is party to.
    pub negotiations: Vec<NegotiationView>,
}

impl UserStateResponse {
    /// Assemble a response from registry entries.
    pub fn new(
        user_id: &str,
        status: UserStatus,
        notice: Option<String>,
        negotiations: Vec<NegotiationView>,
    ) -> Self {
        Self {
            user_id: user_id.to_owned(),
            status: status.status,
            session_id: status.session_id,
            spectating: status.spectating,
            notice,
            negotiations,
        }
    }
}
