use serde::Serialize;
use utoipa::ToSchema;

use crate::{dto::format_timestamp, state::SchedulerStatus};

/// Health response returned by the `/healthcheck` route.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("ok", "degraded" or "halted").
    pub status: String,
    /// Failed reconciliation ticks since the last success.
    pub consecutive_failures: u32,
    /// Completion time of the last successful tick.
    pub last_tick_at: Option<String>,
    /// Sessions persisted by the last successful tick.
    pub last_tick_persisted: usize,
    /// I/O timeouts inside the current guard window.
    pub io_timeout_streak: u32,
    /// Why the scheduler stopped, if it did.
    pub halted: Option<String>,
}

impl HealthResponse {
    /// Build a response from the storage flag and the scheduler status.
    pub fn new(degraded: bool, scheduler: &SchedulerStatus) -> Self {
        let status = if scheduler.halted.is_some() {
            "halted"
        } else if degraded {
            "degraded"
        } else {
            "ok"
        };

        Self {
            status: status.to_string(),
            consecutive_failures: scheduler.consecutive_failures,
            last_tick_at: scheduler.last_tick_at.map(format_timestamp),
            last_tick_persisted: scheduler
                .last_report
                .as_ref()
                .map(|report| report.persisted)
                .unwrap_or_default(),
            io_timeout_streak: scheduler.io_timeout_streak,
            halted: scheduler.halted.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halted_scheduler_wins_over_degraded_flag() {
        let status = SchedulerStatus {
            halted: Some("memory ceiling".into()),
            ..SchedulerStatus::default()
        };
        assert_eq!(HealthResponse::new(true, &status).status, "halted");
        assert_eq!(
            HealthResponse::new(true, &SchedulerStatus::default()).status,
            "degraded"
        );
        assert_eq!(
            HealthResponse::new(false, &SchedulerStatus::default()).status,
            "ok"
        );
    }
}
