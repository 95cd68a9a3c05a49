//! One reconciliation tick: load, simulate, resolve conflicts, persist real deltas, sweep
//! connections and sessions, expire negotiations, run calendar jobs and enforce the guards.
//!
//! Nothing that goes wrong with a single session or a single storage call escapes a tick:
//! timeouts fall back to the best previously-known state, stale writes are dropped in
//! favour of the authoritative copy and faulty sessions are skipped. Only a [`HaltReason`]
//! is fatal.

use std::{collections::HashSet, sync::Arc};

use indexmap::IndexMap;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::{
    dao::{session_store::SessionStore, storage::StorageError},
    dto::session::SessionUpdate,
    services::{
        calendar::{CalendarJobs, CalendarTracker, LoggedCalendarJobs},
        gateway::BroadcastGateway,
        health_guard::{
            Bounded, HaltReason, HealthGuard, MemoryProbe, ProcStatusProbe, with_deadline,
        },
        simulation::{SessionSimulator, TurnClockSimulator},
    },
    state::{
        SharedState,
        conflict::{self, Authority},
        lifecycle::{self, LifecyclePolicy, Presence, Transition},
        session::{LiveSession, SessionId, SessionKind, Timestamp, UserId},
        signature::{SessionSignature, signature},
    },
};

/// Notice delivered to both participants of a mutually abandoned session.
const ABANDONMENT_NOTICE: &str =
    "Your game was closed because both players left and nobody was watching.";

/// Failure of a whole tick. Everything but [`TickError::Fatal`] is retried with backoff.
#[derive(Debug, Error)]
pub enum TickError {
    /// No session store is installed.
    #[error("no session store installed (degraded mode)")]
    Degraded,
    /// Loading the active sessions failed and no snapshot was available.
    #[error("failed to load active sessions")]
    Store(#[source] StorageError),
    /// The tick panicked.
    #[error("tick panicked: {0}")]
    Panicked(String),
    /// A guard decided the process must stop.
    #[error(transparent)]
    Fatal(#[from] HaltReason),
}

/// Counters describing what one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Sessions in the working batch.
    pub loaded: usize,
    /// Whether the batch came from the cached snapshot.
    pub from_snapshot: bool,
    /// Users seeded by the post-restart registry rebuild.
    pub rebuilt_statuses: usize,
    /// Connection records dropped for a stale heartbeat.
    pub evicted_connections: usize,
    /// Practice heartbeats refreshed instead of evicted.
    pub refreshed_practice: usize,
    /// Sessions handed to the simulator.
    pub simulated: usize,
    /// Per-session failures that were isolated.
    pub faults: usize,
    /// Lifecycle transitions applied.
    pub transitions: usize,
    /// Sessions deleted for mutual abandonment.
    pub abandoned: usize,
    /// Sessions skipped because their signature did not move.
    pub unchanged: usize,
    /// Sessions written back and broadcast.
    pub persisted: usize,
    /// Local updates dropped in favour of a newer authoritative copy.
    pub conflicts: usize,
    /// Local updates dropped because no authoritative copy could be read.
    pub discarded: usize,
    /// Users reached by broadcasts.
    pub broadcasts: usize,
    /// Ended sessions garbage collected.
    pub collected: usize,
    /// Negotiations removed past their deadline.
    pub expired_negotiations: usize,
    /// Status entries pruned.
    pub pruned_statuses: usize,
    /// Calendar jobs started.
    pub calendar_jobs: usize,
    /// Cache entries evicted by the memory guard.
    pub evicted_cache_entries: usize,
}

impl TickReport {
    /// Whether the tick did anything worth an info line.
    pub fn has_activity(&self) -> bool {
        self.evicted_connections
            + self.faults
            + self.transitions
            + self.abandoned
            + self.persisted
            + self.conflicts
            + self.discarded
            + self.collected
            + self.expired_negotiations
            + self.calendar_jobs
            + self.evicted_cache_entries
            > 0
    }
}

/// External collaborators of the reconciler.
#[derive(Clone)]
pub struct Collaborators {
    /// Session simulation step.
    pub simulator: Arc<dyn SessionSimulator>,
    /// Push channel towards participants and spectators.
    pub gateway: Arc<dyn BroadcastGateway>,
    /// Daily and weekly maintenance.
    pub calendar: Arc<dyn CalendarJobs>,
    /// Process memory sampling.
    pub memory: Arc<dyn MemoryProbe>,
}

impl Collaborators {
    /// Production collaborators wired to `state`.
    pub fn defaults(state: &SharedState) -> Self {
        Self {
            simulator: Arc::new(TurnClockSimulator),
            gateway: state.gateway().clone(),
            calendar: Arc::new(LoggedCalendarJobs),
            memory: Arc::new(ProcStatusProbe),
        }
    }
}

struct Tracked {
    before: SessionSignature,
    session: LiveSession,
}

/// Owner of the per-process tick state.
pub struct Reconciler {
    state: SharedState,
    collaborators: Collaborators,
    policy: LifecyclePolicy,
    guard: HealthGuard,
    calendar: CalendarTracker,
    rebuilt: bool,
}

impl Reconciler {
    /// Build a reconciler over `state`.
    pub fn new(state: SharedState, collaborators: Collaborators) -> Self {
        let policy = LifecyclePolicy::from(state.config());
        let guard = HealthGuard::new(
            state.config(),
            state.clock().clone(),
            collaborators.memory.clone(),
        );
        Self {
            state,
            collaborators,
            policy,
            guard,
            calendar: CalendarTracker::default(),
            rebuilt: false,
        }
    }

    /// I/O timeouts inside the current guard window.
    pub fn io_timeout_streak(&self) -> u32 {
        self.guard.io_timeout_streak()
    }

    /// Run one tick.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let now = self.state.now();
        let mut report = TickReport::default();
        debug!(now, "reconciliation tick started");

        let Some(store) = self.state.session_store().await else {
            self.expire_negotiations(now, &mut report);
            self.guard.enforce(self.state.cache()).await?;
            return Err(TickError::Degraded);
        };

        let active = self.load_active(&store, now, &mut report).await?;

        if !self.rebuilt && !report.from_snapshot {
            report.rebuilt_statuses = self.state.registry().rebuild_from_sessions(&active, now);
            self.rebuilt = true;
            if report.rebuilt_statuses > 0 {
                info!(
                    seeded = report.rebuilt_statuses,
                    "rebuilt user statuses from active sessions"
                );
            }
        }

        self.sweep_connections(&active, now, &mut report);

        let mut working = IndexMap::with_capacity(active.len());
        for session in active {
            if let Err(fault) = session.validate() {
                error!(session_id = %session.id, error = %fault, "skipping malformed session");
                report.faults += 1;
                continue;
            }
            working.insert(
                session.id,
                Tracked {
                    before: signature(&session),
                    session,
                },
            );
        }
        report.loaded = working.len();

        self.simulate(&mut working, now, &mut report).await;
        self.run_lifecycle(&store, &mut working, now, &mut report).await;

        let active_participants: HashSet<UserId> = working
            .values()
            .flat_map(|tracked| tracked.session.human_participants().map(str::to_owned))
            .collect();

        self.persist(&store, working, now, &mut report).await;
        self.collect_garbage(&store, now, &mut report).await;
        self.expire_negotiations(now, &mut report);
        self.prune_statuses(&active_participants, now, &mut report);
        self.run_calendar_jobs(now, &mut report);

        let guard = self.guard.enforce(self.state.cache()).await?;
        report.evicted_cache_entries = guard.evicted;

        if report.has_activity() {
            info!(?report, "reconciliation tick finished");
        } else {
            debug!("reconciliation tick finished");
        }
        Ok(report)
    }

    async fn load_active(
        &mut self,
        store: &Arc<dyn SessionStore>,
        now: Timestamp,
        report: &mut TickReport,
    ) -> Result<Vec<LiveSession>, TickError> {
        let limit = self.state.config().io_deadline();
        let cache = self.state.cache();

        match self
            .guard
            .bounded(limit, "load_active_sessions", store.load_active_sessions())
            .await
        {
            Some(Ok(sessions)) => {
                cache.remember_active(&sessions, now).await;
                Ok(sessions)
            }
            Some(Err(err)) => match cache.freshest_snapshot().await {
                Some(snapshot) => {
                    warn!(error = %err, "loading active sessions failed; using last snapshot");
                    report.from_snapshot = true;
                    Ok(snapshot)
                }
                None => Err(TickError::Store(err)),
            },
            None => match cache.freshest_snapshot().await {
                Some(snapshot) => {
                    report.from_snapshot = true;
                    Ok(snapshot)
                }
                None => {
                    warn!("no active snapshot to fall back to; continuing with an empty batch");
                    report.from_snapshot = true;
                    Ok(Vec::new())
                }
            },
        }
    }

    fn sweep_connections(&self, active: &[LiveSession], now: Timestamp, report: &mut TickReport) {
        let registry = self.state.registry();
        let timeout_ms = self.state.config().heartbeat_timeout_ms;
        let stale: HashSet<UserId> = registry
            .connections
            .stale(now, timeout_ms)
            .into_iter()
            .collect();
        if stale.is_empty() {
            return;
        }

        let practicing: HashSet<&str> = active
            .iter()
            .filter(|s| s.kind == SessionKind::Practice && !s.status.is_terminal())
            .flat_map(|s| s.human_participants())
            .collect();

        for user in &stale {
            if practicing.contains(user.as_str()) {
                registry.connections.touch(user, now);
                report.refreshed_practice += 1;
            } else if registry.connections.remove_if_stale(user, now, timeout_ms) {
                debug!(user_id = %user, "evicted stale connection");
                report.evicted_connections += 1;
            }
        }
    }

    fn has_online_participant(&self, session: &LiveSession) -> bool {
        let connections = &self.state.registry().connections;
        session
            .human_participants()
            .any(|user| connections.is_connected(user))
    }

    fn connected_spectators(&self, id: SessionId) -> Vec<UserId> {
        let registry = self.state.registry();
        registry
            .statuses
            .spectators_of(id)
            .into_iter()
            .filter(|user| registry.connections.is_connected(user))
            .collect()
    }

    fn presence_of(&self, session: &LiveSession) -> Presence {
        let connections = &self.state.registry().connections;
        Presence {
            seats: [
                connections.is_connected(&session.participants[0]),
                connections.is_connected(&session.participants[1]),
            ],
            spectators: self.connected_spectators(session.id).len(),
        }
    }

    async fn simulate(
        &self,
        working: &mut IndexMap<SessionId, Tracked>,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        let batch: Vec<LiveSession> = working
            .values()
            .map(|tracked| &tracked.session)
            .filter(|s| !s.status.is_terminal())
            .filter(|s| s.kind == SessionKind::Practice || self.has_online_participant(s))
            .cloned()
            .collect();
        if batch.is_empty() {
            return;
        }
        report.simulated = batch.len();

        let limit = self.state.config().simulation_deadline();
        let advanced = match with_deadline(limit, self.collaborators.simulator.advance(batch, now))
            .await
        {
            Bounded::Answered(advanced) => advanced,
            Bounded::TimedOut => {
                warn!(
                    limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "simulation step exceeded its deadline; keeping the pre-step batch"
                );
                return;
            }
        };

        for next in advanced {
            let Some(tracked) = working.get_mut(&next.id) else {
                error!(session_id = %next.id, "simulator returned a session outside its batch");
                report.faults += 1;
                continue;
            };
            match tracked.session.check_successor(&next) {
                Ok(()) => tracked.session = next,
                Err(fault) => {
                    error!(session_id = %next.id, error = %fault, "discarding faulty simulation result");
                    report.faults += 1;
                }
            }
        }
    }

    async fn run_lifecycle(
        &mut self,
        store: &Arc<dyn SessionStore>,
        working: &mut IndexMap<SessionId, Tracked>,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        let mut abandoned = Vec::new();
        for (id, tracked) in working.iter_mut() {
            let presence = self.presence_of(&tracked.session);
            match lifecycle::reconcile_presence(&mut tracked.session, &presence, now, &self.policy)
            {
                Transition::Unchanged => {}
                Transition::MutualAbandonment => abandoned.push(*id),
                transition => {
                    debug!(session_id = %id, ?transition, "lifecycle transition");
                    report.transitions += 1;
                }
            }
        }

        for id in abandoned {
            if let Some(tracked) = working.shift_remove(&id) {
                self.abandon(store, tracked.session, report).await;
            }
        }
    }

    async fn abandon(
        &mut self,
        store: &Arc<dyn SessionStore>,
        session: LiveSession,
        report: &mut TickReport,
    ) {
        let limit = self.state.config().io_deadline();
        match self
            .guard
            .bounded(limit, "delete_session", store.delete_session(session.id))
            .await
        {
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                error!(session_id = %session.id, error = %err, "failed to delete abandoned session");
                report.faults += 1;
                return;
            }
            None => return,
        }

        let registry = self.state.registry();
        self.state.cache().forget(session.id).await;
        registry.chat.remove(session.id);
        for user in session.human_participants() {
            registry.notices.queue(user, ABANDONMENT_NOTICE);
            registry.statuses.release_session(user, session.id);
        }
        for watcher in registry.statuses.watchers_of(session.id) {
            registry.statuses.detach(&watcher, session.id);
        }

        info!(session_id = %session.id, "deleted mutually abandoned session");
        report.abandoned += 1;
    }

    async fn persist(
        &mut self,
        store: &Arc<dyn SessionStore>,
        working: IndexMap<SessionId, Tracked>,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        let limit = self.state.config().io_deadline();
        let mut saves = JoinSet::new();

        for (id, tracked) in working {
            if signature(&tracked.session) == tracked.before {
                report.unchanged += 1;
                continue;
            }
            let mut local = tracked.session;

            let stored = match self
                .guard
                .bounded(limit, "load_session", store.load_session(id))
                .await
            {
                Some(Ok(Some(stored))) => stored,
                Some(Ok(None)) => {
                    info!(session_id = %id, "session left the store mid-tick; dropping local update");
                    report.discarded += 1;
                    continue;
                }
                Some(Err(err)) => {
                    error!(session_id = %id, error = %err, "failed to reload session; dropping local update");
                    report.faults += 1;
                    report.discarded += 1;
                    continue;
                }
                None => match self.state.cache().peek(id) {
                    Some(cached) => cached,
                    None => {
                        warn!(session_id = %id, "no authoritative copy within deadline; dropping local update");
                        report.discarded += 1;
                        continue;
                    }
                },
            };

            if conflict::authoritative(&local, &stored) == Authority::Stored {
                info!(
                    session_id = %id,
                    local_revision = local.revision,
                    stored_revision = stored.revision,
                    "authoritative copy is newer; adopting it"
                );
                self.state.cache().put(stored, now);
                report.conflicts += 1;
                continue;
            }

            let registry = self.state.registry();
            let messages = std::mem::take(&mut local.pending_system_messages);
            if !messages.is_empty() {
                registry.chat.append_system(id, messages, now);
            }
            if local.status.is_terminal() {
                for user in local.human_participants() {
                    registry.statuses.finish_session(user, id);
                }
            }

            self.state.cache().put(local.clone(), now);
            let save = store.save_session(local.clone());
            saves.spawn(async move { (id, with_deadline(limit, save).await) });

            let spectators = self.connected_spectators(id);
            let update = SessionUpdate::from_session(&local, registry.chat.recent(id));
            report.broadcasts +=
                self.collaborators
                    .gateway
                    .broadcast_to_participants(&local, &spectators, &update);
            report.persisted += 1;
        }

        while let Some(joined) = saves.join_next().await {
            match joined {
                Ok((_, Bounded::Answered(Ok(())))) => self.guard.record_success(),
                Ok((id, Bounded::Answered(Err(err)))) => {
                    self.guard.record_success();
                    error!(session_id = %id, error = %err, "failed to save session");
                    report.faults += 1;
                }
                Ok((id, Bounded::TimedOut)) => {
                    warn!(session_id = %id, "saving session exceeded its deadline");
                    self.guard.record_timeout();
                }
                Err(err) => {
                    error!(error = %err, "save task failed");
                    report.faults += 1;
                }
            }
        }
    }

    async fn collect_garbage(
        &mut self,
        store: &Arc<dyn SessionStore>,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        let limit = self.state.config().io_deadline();
        let ended = match self
            .guard
            .bounded(limit, "load_ended_sessions", store.load_ended_sessions())
            .await
        {
            Some(Ok(ended)) => ended,
            Some(Err(err)) => {
                warn!(error = %err, "failed to load ended sessions; skipping collection");
                return;
            }
            None => return,
        };

        for session in ended {
            let registry = self.state.registry();
            if registry.is_watched(session.id)
                || registry.negotiations.references_session(session.id, now)
            {
                continue;
            }

            match self
                .guard
                .bounded(limit, "delete_session", store.delete_session(session.id))
                .await
            {
                Some(Ok(_)) => {
                    self.state.cache().forget(session.id).await;
                    registry.chat.remove(session.id);
                    for watcher in registry.statuses.watchers_of(session.id) {
                        registry.statuses.detach(&watcher, session.id);
                    }
                    debug!(session_id = %session.id, "collected ended session");
                    report.collected += 1;
                }
                Some(Err(err)) => {
                    warn!(session_id = %session.id, error = %err, "failed to collect ended session");
                }
                None => return,
            }
        }
    }

    fn expire_negotiations(&self, now: Timestamp, report: &mut TickReport) {
        let registry = self.state.registry();
        let expired = registry.negotiations.expire(now);
        for negotiation in &expired {
            for user in [&negotiation.from, &negotiation.to] {
                if !registry.negotiations.binds(user, now) {
                    registry.statuses.release_from_negotiation(user);
                }
            }
            debug!(negotiation_id = %negotiation.id, "negotiation expired");
        }
        report.expired_negotiations = expired.len();
    }

    fn prune_statuses(
        &self,
        active_participants: &HashSet<UserId>,
        now: Timestamp,
        report: &mut TickReport,
    ) {
        let registry = self.state.registry();
        report.pruned_statuses = registry.statuses.prune(|user| {
            registry.connections.is_connected(user)
                || active_participants.contains(user)
                || registry.negotiations.binds(user, now)
        });
    }

    fn run_calendar_jobs(&mut self, now: Timestamp, report: &mut TickReport) {
        let limit = self.state.config().io_deadline();
        for kind in self.calendar.observe(now) {
            let job = self.collaborators.calendar.run(kind);
            tokio::spawn(async move {
                match with_deadline(limit, job).await {
                    Bounded::Answered(Ok(())) => debug!(job = %kind, "calendar job finished"),
                    Bounded::Answered(Err(err)) => {
                        error!(job = %kind, error = %err, "calendar job failed")
                    }
                    Bounded::TimedOut => warn!(job = %kind, "calendar job exceeded its deadline"),
                }
            });
            report.calendar_jobs += 1;
        }
    }
}
