//! Targeted push of session updates to connected users.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::{
    dto::session::SessionUpdate,
    state::session::{LiveSession, UserId},
};

/// Delivers a session update to the people looking at that session, never globally.
pub trait BroadcastGateway: Send + Sync {
    /// Push `update` to the human participants of `session` and to `spectators`.
    /// Returns the number of users reached.
    fn broadcast_to_participants(
        &self,
        session: &LiveSession,
        spectators: &[UserId],
        update: &SessionUpdate,
    ) -> usize;
}

/// Handle used to push updates to one live socket of a user.
#[derive(Clone)]
pub struct LiveConnection {
    /// Identifier of the socket, so a stale socket cannot unsubscribe a newer one.
    pub id: Uuid,
    /// Writer side of the socket's outbound queue.
    pub tx: mpsc::UnboundedSender<SessionUpdate>,
}

/// Gateway over one unbounded channel per connected user.
#[derive(Default)]
pub struct ChannelGateway {
    connections: DashMap<UserId, LiveConnection>,
}

impl ChannelGateway {
    /// Register a socket for `user`, replacing any previous one.
    pub fn subscribe(&self, user: &str) -> (Uuid, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.connections
            .insert(user.to_owned(), LiveConnection { id, tx });
        (id, rx)
    }

    /// Drop the socket `id` of `user` if it is still the registered one.
    pub fn unsubscribe(&self, user: &str, id: Uuid) {
        self.connections
            .remove_if(user, |_, connection| connection.id == id);
    }

    /// Whether `user` has a live socket.
    pub fn is_subscribed(&self, user: &str) -> bool {
        self.connections.contains_key(user)
    }

    /// Push `update` to `user`; closed channels are pruned.
    pub fn send_to(&self, user: &str, update: &SessionUpdate) -> bool {
        let Some(connection) = self.connections.get(user).map(|entry| entry.value().clone())
        else {
            return false;
        };

        if connection.tx.send(update.clone()).is_ok() {
            return true;
        }

        debug!(user_id = %user, "pruning closed live channel");
        self.unsubscribe(user, connection.id);
        false
    }
}

impl BroadcastGateway for ChannelGateway {
    fn broadcast_to_participants(
        &self,
        session: &LiveSession,
        spectators: &[UserId],
        update: &SessionUpdate,
    ) -> usize {
        let mut recipients: Vec<&str> = session.human_participants().collect();
        for spectator in spectators {
            if !recipients.contains(&spectator.as_str()) {
                recipients.push(spectator);
            }
        }

        recipients
            .into_iter()
            .filter(|user| self.send_to(user, update))
            .count()
    }
}
