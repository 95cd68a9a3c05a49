use std::sync::Arc;

use futures::{TryStreamExt, future::BoxFuture};
use mongodb::{Client, Collection, Database, bson::doc, options::IndexOptions};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{MongoSessionDocument, doc_id, terminal_statuses},
};
use crate::{
    dao::{session_store::SessionStore, storage::StorageResult},
    state::session::LiveSession,
};

const SESSION_COLLECTION_NAME: &str = "live_sessions";

/// MongoDB-backed session store.
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoSessionStore {
    /// Establish a connection to MongoDB and ensure indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let collection = self.collection().await;
        let index = mongodb::IndexModel::builder()
            .keys(doc! {"status": 1})
            .options(
                IndexOptions::builder()
                    .name(Some("session_status_idx".to_owned()))
                    .build(),
            )
            .build();

        collection
            .create_index(index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION_NAME,
                index: "status",
                source,
            })?;

        Ok(())
    }

    async fn collection(&self) -> Collection<MongoSessionDocument> {
        let guard = self.inner.state.read().await;
        guard
            .database
            .collection::<MongoSessionDocument>(SESSION_COLLECTION_NAME)
    }

    async fn list(&self, terminal: bool) -> MongoResult<Vec<LiveSession>> {
        let scope = if terminal { "ended" } else { "active" };
        let filter = if terminal {
            doc! {"status": {"$in": terminal_statuses()}}
        } else {
            doc! {"status": {"$nin": terminal_statuses()}}
        };

        let documents: Vec<MongoSessionDocument> = self
            .collection()
            .await
            .find(filter)
            .await
            .map_err(|source| MongoDaoError::ListSessions { scope, source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::ListSessions { scope, source })?;

        // A corrupt document must not hide every other session from the reconciler.
        Ok(documents
            .into_iter()
            .filter_map(|document| match LiveSession::try_from(document) {
                Ok(session) => Some(session),
                Err(err) => {
                    warn!(error = %err, "skipping corrupt session document");
                    None
                }
            })
            .collect())
    }

    async fn find_session(&self, id: Uuid) -> MongoResult<Option<LiveSession>> {
        let document = self
            .collection()
            .await
            .find_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::LoadSession { id, source })?;

        document.map(LiveSession::try_from).transpose()
    }

    async fn save_session(&self, session: LiveSession) -> MongoResult<()> {
        let id = session.id;
        let document = MongoSessionDocument::from(&session);
        self.collection()
            .await
            .replace_one(doc_id(id), &document)
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::SaveSession { id, source })?;
        Ok(())
    }

    async fn delete_session(&self, id: Uuid) -> MongoResult<bool> {
        let result = self
            .collection()
            .await
            .delete_one(doc_id(id))
            .await
            .map_err(|source| MongoDaoError::DeleteSession { id, source })?;
        Ok(result.deleted_count > 0)
    }
}

impl SessionStore for MongoSessionStore {
    fn load_active_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<LiveSession>>> {
        let store = self.clone();
        Box::pin(async move { store.list(false).await.map_err(Into::into) })
    }

    fn load_ended_sessions(&self) -> BoxFuture<'static, StorageResult<Vec<LiveSession>>> {
        let store = self.clone();
        Box::pin(async move { store.list(true).await.map_err(Into::into) })
    }

    fn load_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<LiveSession>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session(id).await.map_err(Into::into) })
    }

    fn save_session(&self, session: LiveSession) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.save_session(session).await.map_err(Into::into) })
    }

    fn delete_session(&self, id: Uuid) -> BoxFuture<'static, StorageResult<bool>> {
        let store = self.clone();
        Box::pin(async move { store.delete_session(id).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
