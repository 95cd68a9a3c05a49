//! Tabletop Live Back binary entrypoint wiring the reconciler, REST, WebSocket and storage layers.

use std::{env, future::IntoFuture, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "mongo-store")]
use tabletop_live_back::dao::session_store::mongodb::{MongoConfig, MongoSessionStore};
use tabletop_live_back::{
    config::ReconcilerConfig,
    dao::{
        session_store::{InMemorySessionStore, SessionStore},
        storage::StorageError,
    },
    routes,
    services::{reconcile::Collaborators, scheduler::Scheduler, storage_supervisor},
    state::{AppState, SharedState},
};

const DEFAULT_BACKEND: &str = if cfg!(feature = "mongo-store") {
    "mongo"
} else {
    "memory"
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ReconcilerConfig::load();
    let app_state = AppState::new(config);

    spawn_storage_supervisor(app_state.clone())?;

    let scheduler = Scheduler::new(app_state.clone(), Collaborators::defaults(&app_state));
    let scheduler_task = tokio::spawn(async move { scheduler.run().await });

    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let server = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::select! {
        served = server => {
            served.context("serving axum")?;
            Ok(())
        }
        halted = scheduler_task => {
            let reason = halted.context("reconciler task failed")?;
            error!(reason = %reason, "reconciler halted; exiting for a supervised restart");
            bail!("reconciler halted: {reason}")
        }
    }
}

/// Start the session store supervisor for the backend named by `SESSION_STORE`.
fn spawn_storage_supervisor(state: SharedState) -> anyhow::Result<()> {
    let backend = env::var("SESSION_STORE").unwrap_or_else(|_| DEFAULT_BACKEND.into());
    info!(backend = %backend, "selecting session store backend");

    match backend.as_str() {
        "memory" => {
            let store = InMemorySessionStore::new();
            tokio::spawn(storage_supervisor::run(state, move || {
                let store = store.clone();
                async move { Ok::<_, StorageError>(Arc::new(store) as Arc<dyn SessionStore>) }
            }));
        }
        #[cfg(feature = "mongo-store")]
        "mongo" => {
            tokio::spawn(storage_supervisor::run(state, || async {
                let config = MongoConfig::from_env().await?;
                let store = MongoSessionStore::connect(config).await?;
                Ok::<_, StorageError>(Arc::new(store) as Arc<dyn SessionStore>)
            }));
        }
        other => bail!("unknown SESSION_STORE backend `{other}`"),
    }
    Ok(())
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
