/// In-process backend.
pub mod memory;
/// MongoDB backend.
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::future::BoxFuture;

use crate::{
    dao::storage::StorageResult,
    state::session::{LiveSession, SessionId},
};

pub use self::memory::InMemorySessionStore;

/// Durable storage of live session records.
///
/// Every method hands back a `'static` future so callers can put a deadline on it or move it
/// into a spawned task.
pub trait SessionStore: Send + Sync {
    /// Every session whose status is not terminal.
    fn load_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<LiveSession>>>;
    /// Every session in a terminal status.
    fn load_ended_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<LiveSession>>>;
    /// Authoritative copy of one session.
    fn load_session(&self, id: SessionId) -> BoxFuture<'static, StorageResult<Option<LiveSession>>>;
    /// Insert or replace a session.
    fn save_session(&self, session: LiveSession) -> BoxFuture<'static, StorageResult<()>>;
    /// Delete a session; returns whether something was removed.
    fn delete_session(&self, id: SessionId) -> BoxFuture<'static, StorageResult<bool>>;
    /// Cheap liveness probe of the backend.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Re-establish the backend connection after a failed health check.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
