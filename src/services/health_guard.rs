//! Self-protection of the reconciler: memory pressure levels and an I/O timeout breaker.
//!
//! Both guards end in a [`HaltReason`]; the scheduler stops and the process exits so the
//! hosting platform can restart it.

use std::{
    collections::VecDeque,
    fs,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::{
    config::ReconcilerConfig,
    state::{cache::SessionCache, clock::Clock, session::Timestamp},
};

/// Why the scheduler stopped for good.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HaltReason {
    /// Too many consecutive failed ticks.
    #[error("{failures} consecutive tick failures exceeded the ceiling of {ceiling}")]
    FailureCeiling {
        /// Observed failures.
        failures: u32,
        /// Configured ceiling.
        ceiling: u32,
    },
    /// Too many consecutive I/O timeouts inside the guard window.
    #[error("{timeouts} consecutive I/O timeouts within {window_ms}ms reached the ceiling")]
    IoTimeoutCeiling {
        /// Timeouts inside the window.
        timeouts: u32,
        /// Length of the window.
        window_ms: u64,
    },
    /// Resident memory crossed the fatal threshold.
    #[error("resident memory of {resident_bytes} bytes crossed the fatal threshold")]
    MemoryCeiling {
        /// Sampled resident set size.
        resident_bytes: u64,
    },
}

/// Source of the process memory footprint.
pub trait MemoryProbe: Send + Sync {
    /// Resident set size in bytes, when it can be sampled.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads `VmRSS` from `/proc/self/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// Probe returning whatever it was last told.
#[derive(Debug, Default)]
pub struct FixedMemoryProbe {
    bytes: AtomicU64,
}

impl FixedMemoryProbe {
    /// Start at `bytes`.
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    /// Report `bytes` from now on.
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.bytes.load(Ordering::SeqCst))
    }
}

/// Escalating memory pressure levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Below every threshold.
    Normal,
    /// Evict expired cache entries.
    Elevated,
    /// Evict every entry that is not an active session.
    High,
    /// Drop the whole cache.
    Critical,
    /// Drop the whole cache and halt.
    Fatal,
}

/// Byte thresholds of the four pressure levels above [`MemoryPressure::Normal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryThresholds {
    /// Start of [`MemoryPressure::Elevated`].
    pub soft: u64,
    /// Start of [`MemoryPressure::High`].
    pub aggressive: u64,
    /// Start of [`MemoryPressure::Critical`].
    pub critical: u64,
    /// Start of [`MemoryPressure::Fatal`].
    pub fatal: u64,
}

impl MemoryThresholds {
    /// Level of a `resident_bytes` sample.
    pub fn classify(&self, resident_bytes: u64) -> MemoryPressure {
        if resident_bytes >= self.fatal {
            MemoryPressure::Fatal
        } else if resident_bytes >= self.critical {
            MemoryPressure::Critical
        } else if resident_bytes >= self.aggressive {
            MemoryPressure::High
        } else if resident_bytes >= self.soft {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Normal
        }
    }
}

impl From<&ReconcilerConfig> for MemoryThresholds {
    fn from(config: &ReconcilerConfig) -> Self {
        let [soft, aggressive, critical, fatal] = config.memory_thresholds_bytes();
        Self {
            soft,
            aggressive,
            critical,
            fatal,
        }
    }
}

/// Consecutive I/O timeouts inside a sliding window. Any answered call resets the streak.
#[derive(Debug)]
pub struct IoTimeoutWindow {
    timeouts: VecDeque<Timestamp>,
    window_ms: u64,
    ceiling: u32,
}

impl IoTimeoutWindow {
    /// Window of `window_ms` that trips once `ceiling` timeouts fall inside it.
    pub fn new(window_ms: u64, ceiling: u32) -> Self {
        Self {
            timeouts: VecDeque::new(),
            window_ms,
            ceiling,
        }
    }

    /// Record a timeout observed at `now`.
    pub fn record_timeout(&mut self, now: Timestamp) {
        self.timeouts.push_back(now);
        self.slide(now);
    }

    /// Record an answered call.
    pub fn record_success(&mut self) {
        self.timeouts.clear();
    }

    /// Timeouts currently inside the window.
    pub fn streak(&self) -> u32 {
        u32::try_from(self.timeouts.len()).unwrap_or(u32::MAX)
    }

    /// Whether the streak reached the ceiling at `now`.
    pub fn tripped(&mut self, now: Timestamp) -> bool {
        self.slide(now);
        self.streak() >= self.ceiling
    }

    fn slide(&mut self, now: Timestamp) {
        while let Some(oldest) = self.timeouts.front() {
            if now.saturating_sub(*oldest) > self.window_ms {
                self.timeouts.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Outcome of a deadline-bounded call.
pub enum Bounded<T> {
    /// The call answered in time (successfully or not).
    Answered(T),
    /// The deadline expired first.
    TimedOut,
}

/// Await `future` for at most `limit`.
pub async fn with_deadline<F, T>(limit: Duration, future: F) -> Bounded<T>
where
    F: Future<Output = T>,
{
    match timeout(limit, future).await {
        Ok(value) => Bounded::Answered(value),
        Err(_) => Bounded::TimedOut,
    }
}

/// What one enforcement pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardReport {
    /// Level derived from the memory sample.
    pub pressure: MemoryPressure,
    /// Cache entries dropped.
    pub evicted: usize,
}

/// Memory and I/O guards enforced once per tick.
pub struct HealthGuard {
    clock: Arc<dyn Clock>,
    probe: Arc<dyn MemoryProbe>,
    thresholds: MemoryThresholds,
    io_window: IoTimeoutWindow,
}

impl HealthGuard {
    /// Build the guard from the configured thresholds.
    pub fn new(config: &ReconcilerConfig, clock: Arc<dyn Clock>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            clock,
            probe,
            thresholds: MemoryThresholds::from(config),
            io_window: IoTimeoutWindow::new(config.io_timeout_window_ms, config.io_timeout_ceiling),
        }
    }

    /// Await a storage call under `limit`, feeding the outcome to the I/O breaker.
    /// `None` means the deadline expired.
    pub async fn bounded<F, T>(&mut self, limit: Duration, op: &'static str, future: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        match with_deadline(limit, future).await {
            Bounded::Answered(value) => {
                self.io_window.record_success();
                Some(value)
            }
            Bounded::TimedOut => {
                warn!(
                    op,
                    limit_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "storage call exceeded its deadline"
                );
                self.record_timeout();
                None
            }
        }
    }

    /// Feed a timeout observed outside [`HealthGuard::bounded`].
    pub fn record_timeout(&mut self) {
        let now = self.clock.now();
        self.io_window.record_timeout(now);
    }

    /// Feed an answered call observed outside [`HealthGuard::bounded`].
    pub fn record_success(&mut self) {
        self.io_window.record_success();
    }

    /// Timeouts inside the current window.
    pub fn io_timeout_streak(&self) -> u32 {
        self.io_window.streak()
    }

    /// Check the I/O breaker, sample memory and evict from `cache` according to the level.
    pub async fn enforce(&mut self, cache: &SessionCache) -> Result<GuardReport, HaltReason> {
        let now = self.clock.now();
        if self.io_window.tripped(now) {
            let reason = HaltReason::IoTimeoutCeiling {
                timeouts: self.io_window.streak(),
                window_ms: self.io_window.window_ms,
            };
            error!(reason = %reason, "I/O timeout breaker tripped");
            return Err(reason);
        }

        let Some(resident_bytes) = self.probe.resident_bytes() else {
            return Ok(GuardReport {
                pressure: MemoryPressure::Normal,
                evicted: 0,
            });
        };

        let pressure = self.thresholds.classify(resident_bytes);
        let evicted = match pressure {
            MemoryPressure::Normal => 0,
            MemoryPressure::Elevated => cache.evict_expired(now),
            MemoryPressure::High => cache.evict_expired(now) + cache.evict_inactive().await,
            MemoryPressure::Critical | MemoryPressure::Fatal => cache.clear().await,
        };

        if pressure > MemoryPressure::Normal {
            info!(?pressure, resident_bytes, evicted, "memory pressure eviction");
        }

        if pressure == MemoryPressure::Fatal {
            let reason = HaltReason::MemoryCeiling { resident_bytes };
            error!(reason = %reason, "memory ceiling reached");
            return Err(reason);
        }

        Ok(GuardReport { pressure, evicted })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::state::{clock::ManualClock, session::LiveSession};

    const MIB: u64 = 1024 * 1024;

    fn guard(probe: Arc<FixedMemoryProbe>, clock: Arc<ManualClock>) -> HealthGuard {
        let config = ReconcilerConfig {
            io_timeout_ceiling: 2,
            io_timeout_window_ms: 1_000,
            ..ReconcilerConfig::default()
        };
        HealthGuard::new(&config, clock, probe)
    }

    #[test]
    fn parses_vm_rss_in_kib() {
        let status = "Name:\ttabletop\nVmRSS:\t   2048 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss(status), Some(2 * MIB));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn thresholds_escalate() {
        let thresholds = MemoryThresholds::from(&ReconcilerConfig::default());
        assert_eq!(thresholds.classify(100 * MIB), MemoryPressure::Normal);
        assert_eq!(thresholds.classify(600 * MIB), MemoryPressure::Elevated);
        assert_eq!(thresholds.classify(800 * MIB), MemoryPressure::High);
        assert_eq!(thresholds.classify(900 * MIB), MemoryPressure::Critical);
        assert_eq!(thresholds.classify(2048 * MIB), MemoryPressure::Fatal);
    }

    #[test]
    fn timeout_window_slides_and_resets() {
        let mut window = IoTimeoutWindow::new(1_000, 2);
        window.record_timeout(0);
        assert!(!window.tripped(50));
        window.record_timeout(100);
        assert!(window.tripped(150));
        assert!(!window.tripped(1_050));
        window.record_success();
        assert_eq!(window.streak(), 0);
    }

    #[tokio::test]
    async fn critical_pressure_clears_the_cache_and_fatal_halts() {
        let probe = Arc::new(FixedMemoryProbe::new(900 * MIB));
        let clock = Arc::new(ManualClock::starting_at(0));
        let mut guard = guard(probe.clone(), clock);
        let cache = SessionCache::new(1_000);
        cache.put(LiveSession::competitive(Uuid::new_v4(), "ada", "bob", 0), 0);

        let report = guard.enforce(&cache).await.unwrap();
        assert_eq!(report.pressure, MemoryPressure::Critical);
        assert_eq!(report.evicted, 1);
        assert!(cache.is_empty());

        probe.set(4096 * MIB);
        assert!(matches!(
            guard.enforce(&cache).await,
            Err(HaltReason::MemoryCeiling { .. })
        ));
    }

    #[tokio::test]
    async fn bounded_calls_feed_the_breaker() {
        let probe = Arc::new(FixedMemoryProbe::new(0));
        let clock = Arc::new(ManualClock::starting_at(0));
        let mut guard = guard(probe, clock);
        let cache = SessionCache::new(1_000);

        let stalled = guard
            .bounded(Duration::from_millis(10), "load", std::future::pending::<()>())
            .await;
        assert!(stalled.is_none());
        assert!(guard.enforce(&cache).await.is_ok());

        let stalled = guard
            .bounded(Duration::from_millis(10), "load", std::future::pending::<()>())
            .await;
        assert!(stalled.is_none());
        assert_eq!(guard.io_timeout_streak(), 2);
        assert!(matches!(
            guard.enforce(&cache).await,
            Err(HaltReason::IoTimeoutCeiling { timeouts: 2, .. })
        ));

        assert_eq!(
            guard.bounded(Duration::from_millis(10), "load", async { 7 }).await,
            Some(7)
        );
        assert!(guard.enforce(&cache).await.is_ok());
    }
}
