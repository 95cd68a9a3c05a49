/// Read-through session cache and active snapshot.
pub mod cache;
/// Time sources.
pub mod clock;
/// Optimistic concurrency ordering between session copies.
pub mod conflict;
/// Disconnect and reconnect state machine.
pub mod lifecycle;
/// Connection, status, negotiation, notice and chat tables.
pub mod registry;
/// Live session records.
pub mod session;
/// Change detection fingerprints.
pub mod signature;

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::{
    config::ReconcilerConfig,
    dao::session_store::SessionStore,
    error::ServiceError,
    services::{gateway::ChannelGateway, reconcile::TickReport},
};

use self::{
    cache::SessionCache,
    clock::{Clock, SystemClock},
    registry::LiveRegistry,
    session::Timestamp,
};

/// Shared handle to the application state.
pub type SharedState = Arc<AppState>;

/// Last known state of the reconciliation scheduler, published for the health surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStatus {
    /// Completion time of the last successful tick.
    pub last_tick_at: Option<Timestamp>,
    /// Summary of the last successful tick.
    pub last_report: Option<TickReport>,
    /// Failed ticks since the last success.
    pub consecutive_failures: u32,
    /// I/O timeouts inside the current guard window.
    pub io_timeout_streak: u32,
    /// Reason the scheduler stopped, once it has.
    pub halted: Option<String>,
}

/// Central application state shared by the request paths and the reconciler.
pub struct AppState {
    config: ReconcilerConfig,
    session_store: RwLock<Option<Arc<dyn SessionStore>>>,
    degraded: watch::Sender<bool>,
    registry: LiveRegistry,
    cache: SessionCache,
    gateway: Arc<ChannelGateway>,
    clock: Arc<dyn Clock>,
    scheduler: watch::Sender<SchedulerStatus>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: ReconcilerConfig) -> SharedState {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`AppState::new`] with an explicit time source.
    pub fn with_clock(config: ReconcilerConfig, clock: Arc<dyn Clock>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let (scheduler_tx, _rx) = watch::channel(SchedulerStatus::default());
        Arc::new(Self {
            registry: LiveRegistry::new(config.chat_history_limit),
            cache: SessionCache::new(config.cache_ttl_ms),
            config,
            session_store: RwLock::new(None),
            degraded: degraded_tx,
            gateway: Arc::new(ChannelGateway::default()),
            clock,
            scheduler: scheduler_tx,
        })
    }

    /// Runtime tunables.
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Obtain a handle to the current session store, if one is installed.
    pub async fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        let guard = self.session_store.read().await;
        guard.as_ref().cloned()
    }

    /// Session store or [`ServiceError::Degraded`] when none is installed.
    pub async fn require_session_store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        self.session_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new session store implementation and leave degraded mode.
    pub async fn install_session_store(&self, store: Arc<dyn SessionStore>) {
        {
            let mut guard = self.session_store.write().await;
            *guard = Some(store);
        }
        self.set_degraded(false);
    }

    /// Remove the current session store and enter degraded mode.
    pub async fn clear_session_store(&self) {
        {
            let mut guard = self.session_store.write().await;
            guard.take();
        }
        self.set_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn set_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Connections, statuses, negotiations, notices and chat.
    pub fn registry(&self) -> &LiveRegistry {
        &self.registry
    }

    /// Volatile session cache.
    pub fn cache(&self) -> &SessionCache {
        &self.cache
    }

    /// Push channel towards connected users.
    pub fn gateway(&self) -> &Arc<ChannelGateway> {
        &self.gateway
    }

    /// Shared time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current time according to the shared clock.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Publish a new scheduler status.
    pub fn publish_scheduler_status(&self, status: SchedulerStatus) {
        self.scheduler.send_replace(status);
    }

    /// Latest scheduler status.
    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.borrow().clone()
    }

    /// Subscribe to scheduler status updates.
    pub fn scheduler_watcher(&self) -> watch::Receiver<SchedulerStatus> {
        self.scheduler.subscribe()
    }
}
