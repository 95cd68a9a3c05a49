//! Self-rescheduling driver of the reconciler.
//!
//! One tick at a time: a would-be-concurrent tick reports [`TickOutcome::Busy`] and retries
//! after the short re-entry delay. Failures back off multiplicatively and past the failure
//! ceiling the scheduler stops with a [`HaltReason`] so the process can exit.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use futures::FutureExt;
use tokio::{sync::Mutex, time::sleep};
use tracing::{debug, error, warn};

use crate::{
    services::{
        health_guard::HaltReason,
        reconcile::{Collaborators, Reconciler, TickError, TickReport},
    },
    state::{SchedulerStatus, SharedState},
};

/// Result of one scheduling attempt.
#[derive(Debug)]
pub enum TickOutcome {
    /// The tick ran to completion.
    Completed(TickReport),
    /// Another tick was still running; nothing was done.
    Busy,
    /// The tick failed.
    Failed(TickError),
}

/// Delay before the next tick after `failures` consecutive failures.
///
/// `interval * factor^failures`, capped at `max`.
pub fn backoff_delay(interval: Duration, factor: u32, max: Duration, failures: u32) -> Duration {
    let mut delay = interval;
    for _ in 0..failures {
        delay = delay.saturating_mul(factor.max(1));
        if delay >= max {
            return max;
        }
    }
    delay.min(max)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Drives [`Reconciler::tick`] forever, or until a guard halts it.
pub struct Scheduler {
    state: SharedState,
    reconciler: Mutex<Reconciler>,
    failures: AtomicU32,
    io_timeout_streak: AtomicU32,
}

impl Scheduler {
    /// Build a scheduler over `state` with the given collaborators.
    pub fn new(state: SharedState, collaborators: Collaborators) -> Self {
        Self {
            reconciler: Mutex::new(Reconciler::new(state.clone(), collaborators)),
            state,
            failures: AtomicU32::new(0),
            io_timeout_streak: AtomicU32::new(0),
        }
    }

    /// Consecutive failed ticks.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Run one tick unless one is already in flight. Panics are caught and reported as
    /// [`TickError::Panicked`].
    pub async fn tick_once(&self) -> TickOutcome {
        let Ok(mut reconciler) = self.reconciler.try_lock() else {
            return TickOutcome::Busy;
        };

        let outcome = match AssertUnwindSafe(reconciler.tick()).catch_unwind().await {
            Ok(Ok(report)) => TickOutcome::Completed(report),
            Ok(Err(err)) => TickOutcome::Failed(err),
            Err(payload) => TickOutcome::Failed(TickError::Panicked(panic_message(payload))),
        };
        self.io_timeout_streak
            .store(reconciler.io_timeout_streak(), Ordering::SeqCst);
        outcome
    }

    /// Tick until a guard halts the loop; returns why.
    pub async fn run(&self) -> HaltReason {
        let config = self.state.config().clone();

        loop {
            let delay = match self.tick_once().await {
                TickOutcome::Busy => {
                    debug!("tick already running; rescheduling");
                    config.reentry_delay()
                }
                TickOutcome::Completed(report) => {
                    self.failures.store(0, Ordering::SeqCst);
                    self.publish(Some(report), None);
                    config.tick_interval()
                }
                TickOutcome::Failed(TickError::Fatal(reason)) => {
                    self.publish(None, Some(&reason));
                    return reason;
                }
                TickOutcome::Failed(TickError::Degraded) => {
                    debug!("no session store installed; waiting for the storage supervisor");
                    self.publish(None, None);
                    config.tick_interval()
                }
                TickOutcome::Failed(err) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures > config.failure_ceiling {
                        let reason = HaltReason::FailureCeiling {
                            failures,
                            ceiling: config.failure_ceiling,
                        };
                        error!(error = %err, reason = %reason, "tick failure ceiling exceeded");
                        self.publish(None, Some(&reason));
                        return reason;
                    }

                    let delay = backoff_delay(
                        config.tick_interval(),
                        config.backoff_factor,
                        config.max_backoff(),
                        failures,
                    );
                    warn!(
                        error = %err,
                        failures,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "tick failed; backing off"
                    );
                    self.publish(None, None);
                    delay
                }
            };

            sleep(delay).await;
        }
    }

    fn publish(&self, report: Option<TickReport>, halted: Option<&HaltReason>) {
        let previous = self.state.scheduler_status();
        let completed = report.is_some();
        self.state.publish_scheduler_status(SchedulerStatus {
            last_tick_at: if completed {
                Some(self.state.now())
            } else {
                previous.last_tick_at
            },
            last_report: report.or(previous.last_report),
            consecutive_failures: self.consecutive_failures(),
            io_timeout_streak: self.io_timeout_streak.load(Ordering::SeqCst),
            halted: halted.map(ToString::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        config::ReconcilerConfig,
        dao::session_store::InMemorySessionStore,
        services::{
            calendar::LoggedCalendarJobs, gateway::ChannelGateway,
            health_guard::FixedMemoryProbe, simulation::SessionSimulator,
        },
        state::{
            AppState,
            session::{LiveSession, Timestamp},
        },
    };

    struct PanickingSimulator;

    impl SessionSimulator for PanickingSimulator {
        fn advance(&self, _sessions: Vec<LiveSession>, _now: Timestamp) -> BoxFuture<'static, Vec<LiveSession>> {
            Box::pin(async { panic!("simulator exploded") })
        }
    }

    fn collaborators(simulator: Arc<dyn SessionSimulator>, memory: u64) -> Collaborators {
        Collaborators {
            simulator,
            gateway: Arc::new(ChannelGateway::default()),
            calendar: Arc::new(LoggedCalendarJobs),
            memory: Arc::new(FixedMemoryProbe::new(memory)),
        }
    }

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            tick_interval_ms: 1,
            reentry_delay_ms: 1,
            max_backoff_ms: 4,
            failure_ceiling: 2,
            ..ReconcilerConfig::default()
        }
    }

    #[test]
    fn backoff_grows_geometrically_and_is_capped() {
        let interval = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(interval, 2, max, 0), interval);
        assert_eq!(backoff_delay(interval, 2, max, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(interval, 2, max, 3), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(interval, 2, max, 10), max);
        assert_eq!(backoff_delay(interval, 2, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn concurrent_tick_is_reported_busy() {
        let state = AppState::new(ReconcilerConfig::default());
        state
            .install_session_store(Arc::new(InMemorySessionStore::new()))
            .await;
        let scheduler = Scheduler::new(
            state,
            collaborators(Arc::new(crate::services::simulation::TurnClockSimulator), 0),
        );

        let held = scheduler.reconciler.lock().await;
        assert!(matches!(scheduler.tick_once().await, TickOutcome::Busy));
        drop(held);
        assert!(matches!(
            scheduler.tick_once().await,
            TickOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn panics_become_tick_failures() {
        let state = AppState::new(ReconcilerConfig::default());
        let mut practice = LiveSession::practice(uuid::Uuid::new_v4(), "ada", "bot", 0);
        practice.status = crate::state::session::SessionStatus::InProgress;
        let store = InMemorySessionStore::with_sessions([practice]).await;
        state.install_session_store(Arc::new(store)).await;
        let scheduler = Scheduler::new(state, collaborators(Arc::new(PanickingSimulator), 0));

        match scheduler.tick_once().await {
            TickOutcome::Failed(TickError::Panicked(message)) => {
                assert!(message.contains("simulator exploded"))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(matches!(
            scheduler.tick_once().await,
            TickOutcome::Failed(TickError::Panicked(_))
        ));
    }

    #[tokio::test]
    async fn repeated_failures_halt_past_the_ceiling() {
        let state = AppState::new(fast_config());
        let store = InMemorySessionStore::new();
        store.set_offline(true);
        state.install_session_store(Arc::new(store)).await;
        let scheduler = Scheduler::new(
            state.clone(),
            collaborators(Arc::new(crate::services::simulation::TurnClockSimulator), 0),
        );

        let reason = scheduler.run().await;

        assert_eq!(
            reason,
            HaltReason::FailureCeiling {
                failures: 3,
                ceiling: 2
            }
        );
        assert!(state.scheduler_status().halted.is_some());
    }

    #[tokio::test]
    async fn fatal_memory_halts_immediately() {
        let state = AppState::new(fast_config());
        state
            .install_session_store(Arc::new(InMemorySessionStore::new()))
            .await;
        let scheduler = Scheduler::new(
            state,
            collaborators(
                Arc::new(crate::services::simulation::TurnClockSimulator),
                u64::MAX,
            ),
        );

        assert!(matches!(
            scheduler.run().await,
            HaltReason::MemoryCeiling { .. }
        ));
    }

    #[tokio::test]
    async fn sustained_storage_timeouts_halt_at_the_io_ceiling() {
        let config = ReconcilerConfig {
            io_deadline_ms: 10,
            io_timeout_ceiling: 4,
            ..fast_config()
        };
        let window_ms = config.io_timeout_window_ms;
        let state = AppState::new(config);
        let store = InMemorySessionStore::new();
        store.set_latency(Duration::from_millis(200));
        state.install_session_store(Arc::new(store)).await;
        let scheduler = Scheduler::new(
            state.clone(),
            collaborators(Arc::new(crate::services::simulation::TurnClockSimulator), 0),
        );

        // Loading and collection both time out: two timeouts per tick.
        assert!(matches!(
            scheduler.tick_once().await,
            TickOutcome::Completed(_)
        ));
        assert_eq!(scheduler.io_timeout_streak.load(Ordering::SeqCst), 2);

        let reason = scheduler.run().await;

        assert_eq!(
            reason,
            HaltReason::IoTimeoutCeiling {
                timeouts: 4,
                window_ms
            }
        );
        assert_eq!(scheduler.consecutive_failures(), 0);
        assert!(state.scheduler_status().halted.is_some());
    }

    #[tokio::test]
    async fn degraded_ticks_do_not_count_as_failures() {
        let state = AppState::new(fast_config());
        let scheduler = Scheduler::new(
            state,
            collaborators(Arc::new(crate::services::simulation::TurnClockSimulator), 0),
        );

        assert!(matches!(
            scheduler.tick_once().await,
            TickOutcome::Failed(TickError::Degraded)
        ));
        assert_eq!(scheduler.consecutive_failures(), 0);
    }
}
