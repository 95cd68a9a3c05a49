use tracing::warn;

use crate::{dto::health::HealthResponse, services::user_service::call_store, state::SharedState};

/// Report storage and scheduler health while logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    match state.require_session_store().await {
        Ok(store) => {
            if let Err(err) = call_store(state, store.health_check()).await {
                warn!(error = %err, "session store health check failed");
            }
        }
        Err(_) => warn!("session store unavailable (degraded mode)"),
    }

    HealthResponse::new(state.is_degraded(), &state.scheduler_status())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::ReconcilerConfig, dao::session_store::InMemorySessionStore, state::AppState,
    };

    #[tokio::test]
    async fn reports_degraded_until_a_store_is_installed() {
        let state = AppState::new(ReconcilerConfig::default());
        assert_eq!(health_status(&state).await.status, "degraded");

        state
            .install_session_store(Arc::new(InMemorySessionStore::new()))
            .await;
        assert_eq!(health_status(&state).await.status, "ok");
    }
}
