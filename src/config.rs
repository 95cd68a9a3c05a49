//! Reconciler configuration loading, with built-in defaults for every knob.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/reconciler.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "TABLETOP_LIVE_CONFIG_PATH";
const MIB: u64 = 1024 * 1024;

/// Immutable runtime configuration of the live session reconciler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Nominal delay between two ticks.
    pub tick_interval_ms: u64,
    /// Delay before retrying when a tick is already running.
    pub reentry_delay_ms: u64,
    /// Multiplier applied to the delay per consecutive failed tick.
    pub backoff_factor: u32,
    /// Upper bound of the failure backoff.
    pub max_backoff_ms: u64,
    /// Consecutive failed ticks tolerated before the process halts.
    pub failure_ceiling: u32,
    /// Deadline applied to every session store call.
    pub io_deadline_ms: u64,
    /// Deadline applied to the simulation step.
    pub simulation_deadline_ms: u64,
    /// Silence after which a connection record is considered stale.
    pub heartbeat_timeout_ms: u64,
    /// Time a disconnected participant has to come back.
    pub grace_window_ms: u64,
    /// Disconnect timeouts after which a participant forfeits without grace.
    pub max_disconnections: u32,
    /// Sessions with fewer moves than this grant the opponent a claim-void right.
    pub claim_void_move_threshold: usize,
    /// Consecutive storage timeouts tolerated within the window before the process halts.
    pub io_timeout_ceiling: u32,
    /// Sliding window over which storage timeouts are counted.
    pub io_timeout_window_ms: u64,
    /// Lifetime of read-through cache entries.
    pub cache_ttl_ms: u64,
    /// Chat lines retained per session.
    pub chat_history_limit: usize,
    /// Resident memory above which expired cache entries are evicted.
    pub memory_soft_mib: u64,
    /// Resident memory above which inactive cache entries are evicted.
    pub memory_aggressive_mib: u64,
    /// Resident memory above which the whole cache is dropped.
    pub memory_critical_mib: u64,
    /// Resident memory above which the process halts.
    pub memory_fatal_mib: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            reentry_delay_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
            failure_ceiling: 10,
            io_deadline_ms: 2_000,
            simulation_deadline_ms: 2_000,
            heartbeat_timeout_ms: 30_000,
            grace_window_ms: 60_000,
            max_disconnections: 3,
            claim_void_move_threshold: 2,
            io_timeout_ceiling: 5,
            io_timeout_window_ms: 60_000,
            cache_ttl_ms: 30_000,
            chat_history_limit: 100,
            memory_soft_mib: 512,
            memory_aggressive_mib: 768,
            memory_critical_mib: 896,
            memory_fatal_mib: 1_024,
        }
    }
}

impl ReconcilerConfig {
    /// Load the configuration from disk, falling back to the built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<ReconcilerConfig>(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "loaded reconciler config");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Nominal tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Retry delay for a tick that found another tick running.
    pub fn reentry_delay(&self) -> Duration {
        Duration::from_millis(self.reentry_delay_ms)
    }

    /// Upper bound of the failure backoff.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Deadline for session store calls.
    pub fn io_deadline(&self) -> Duration {
        Duration::from_millis(self.io_deadline_ms)
    }

    /// Deadline for the simulation step.
    pub fn simulation_deadline(&self) -> Duration {
        Duration::from_millis(self.simulation_deadline_ms)
    }

    /// Memory thresholds converted to bytes: soft, aggressive, critical, fatal.
    pub fn memory_thresholds_bytes(&self) -> [u64; 4] {
        [
            self.memory_soft_mib,
            self.memory_aggressive_mib,
            self.memory_critical_mib,
            self.memory_fatal_mib,
        ]
        .map(|mib| mib.saturating_mul(MIB))
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_files_keep_defaults_for_missing_fields() {
        let config: ReconcilerConfig =
            serde_json::from_str(r#"{ "tick_interval_ms": 250, "failure_ceiling": 3 }"#).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.failure_ceiling, 3);
        assert_eq!(config.grace_window_ms, ReconcilerConfig::default().grace_window_ms);
    }

    #[test]
    fn memory_thresholds_are_expressed_in_bytes() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.memory_thresholds_bytes()[0], 512 * MIB);
        assert_eq!(config.memory_thresholds_bytes()[3], 1_024 * MIB);
    }
}
