use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    dto::session::SessionUpdate,
    services::user_service::{find_session, heartbeat},
    state::SharedState,
};

/// The writer side of the socket is gone.
#[derive(Debug, Error)]
#[error("connection closed")]
struct ConnectionClosed;

/// Serve the live update socket of `user_id` until either side closes it.
///
/// Every inbound frame counts as a heartbeat. Session updates addressed to the user by the
/// gateway are forwarded as JSON text frames.
pub async fn handle_socket(state: SharedState, user_id: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    if let Err(err) = heartbeat(&state, &user_id) {
        warn!(user_id = %user_id, error = %err, "rejecting live socket");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    }

    let (connection_id, mut updates) = state.gateway().subscribe(&user_id);
    info!(user_id = %user_id, %connection_id, "live socket connected");

    if let Some(update) = current_session_update(&state, &user_id).await {
        if send_message_to_websocket(&outbound_tx, &update).is_err() {
            state.gateway().unsubscribe(&user_id, connection_id);
            finalize(writer_task, outbound_tx).await;
            return;
        }
    }

    let forward_tx = outbound_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            if send_message_to_websocket(&forward_tx, &update).is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Ping(payload)) => {
                touch(&state, &user_id);
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(_) => touch(&state, &user_id),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "websocket error");
                break;
            }
        }
    }

    state.gateway().unsubscribe(&user_id, connection_id);
    forwarder.abort();
    let _ = forwarder.await;
    info!(user_id = %user_id, %connection_id, "live socket disconnected");

    finalize(writer_task, outbound_tx).await;
}

fn touch(state: &SharedState, user_id: &str) {
    state.registry().connections.touch(user_id, state.now());
}

/// Snapshot of the session the user plays in or watches, sent right after connecting.
async fn current_session_update(state: &SharedState, user_id: &str) -> Option<SessionUpdate> {
    let status = state.registry().statuses.get(user_id)?;
    let session_id = status.spectating.or(status.session_id)?;
    match find_session(state, session_id).await {
        Ok(session) => Some(SessionUpdate::from_session(
            &session,
            state.registry().chat.recent(session_id),
        )),
        Err(err) => {
            debug!(user_id = %user_id, session_id = %session_id, error = %err, "no initial session snapshot");
            None
        }
    }
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Serialization failures are logged and swallowed; only a closed writer is an error.
fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), ConnectionClosed>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return Ok(());
        }
    };

    tx.send(Message::Text(payload.into()))
        .map_err(|_| ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;
    use crate::{
        config::ReconcilerConfig,
        dao::session_store::InMemorySessionStore,
        state::{AppState, session::LiveSession},
    };

    #[test]
    fn updates_are_sent_as_text_frames() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        let update = SessionUpdate::from_session(&session, Vec::new());

        send_message_to_websocket(&tx, &update).unwrap();
        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected a text frame");
        };
        assert!(text.as_str().contains("\"type\":\"session_update\""));

        drop(rx);
        assert!(send_message_to_websocket(&tx, &update).is_err());
    }

    #[tokio::test]
    async fn seated_users_get_their_session_on_connect() {
        let session = LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0);
        let state = AppState::new(ReconcilerConfig::default());
        state
            .install_session_store(Arc::new(
                InMemorySessionStore::with_sessions([session.clone()]).await,
            ))
            .await;

        assert!(current_session_update(&state, "ada").await.is_none());
        state.registry().statuses.seat("ada", session.id);
        let update = current_session_update(&state, "ada").await.unwrap();
        assert_eq!(update.session_id, session.id);
    }
}
