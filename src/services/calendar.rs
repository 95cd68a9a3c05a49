//! Daily and weekly maintenance jobs triggered when the tick clock crosses a UTC boundary.

use std::fmt;

use futures::future::BoxFuture;
use time::OffsetDateTime;
use tracing::info;

use crate::{dao::storage::StorageResult, state::session::Timestamp};

/// Boundary a maintenance job is keyed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalendarJobKind {
    /// UTC day rollover.
    Daily,
    /// ISO week rollover.
    Weekly,
}

impl fmt::Display for CalendarJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalendarJobKind::Daily => f.write_str("daily"),
            CalendarJobKind::Weekly => f.write_str("weekly"),
        }
    }
}

/// Idempotent maintenance tasks (ranking rollups, quest resets).
///
/// `run` may be invoked more than once for the same boundary.
pub trait CalendarJobs: Send + Sync {
    /// Run the job of `kind`.
    fn run(&self, kind: CalendarJobKind) -> BoxFuture<'static, StorageResult<()>>;
}

/// Jobs implementation that only records the boundary in the logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggedCalendarJobs;

impl CalendarJobs for LoggedCalendarJobs {
    fn run(&self, kind: CalendarJobKind) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async move {
            info!(job = %kind, "calendar boundary crossed");
            Ok(())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CalendarKey {
    day: i32,
    iso_week: (i32, u8),
}

impl CalendarKey {
    fn at(now: Timestamp) -> Option<Self> {
        let date = OffsetDateTime::from_unix_timestamp_nanos(i128::from(now) * 1_000_000)
            .ok()?
            .date();
        let (year, week, _) = date.to_iso_week_date();
        Some(Self {
            day: date.to_julian_day(),
            iso_week: (year, week),
        })
    }
}

/// Remembers the last observed day and ISO week and reports which boundaries were crossed.
#[derive(Debug, Default)]
pub struct CalendarTracker {
    last: Option<CalendarKey>,
}

impl CalendarTracker {
    /// Boundaries crossed since the previous observation. The first observation crosses both.
    pub fn observe(&mut self, now: Timestamp) -> Vec<CalendarJobKind> {
        let Some(key) = CalendarKey::at(now) else {
            return Vec::new();
        };

        let mut due = Vec::new();
        match self.last {
            None => {
                due.push(CalendarJobKind::Daily);
                due.push(CalendarJobKind::Weekly);
            }
            Some(previous) => {
                if key.day != previous.day {
                    due.push(CalendarJobKind::Daily);
                }
                if key.iso_week != previous.iso_week {
                    due.push(CalendarJobKind::Weekly);
                }
            }
        }

        self.last = Some(key);
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: u64 = 24 * 60 * 60 * 1_000;
    // 2024-01-01T00:00:00Z, a Monday.
    const MONDAY: u64 = 1_704_067_200_000;

    #[test]
    fn first_observation_runs_everything() {
        let mut tracker = CalendarTracker::default();
        assert_eq!(
            tracker.observe(MONDAY + 1_000),
            vec![CalendarJobKind::Daily, CalendarJobKind::Weekly]
        );
        assert!(tracker.observe(MONDAY + 2_000).is_empty());
    }

    #[test]
    fn day_boundary_inside_a_week_is_daily_only() {
        let mut tracker = CalendarTracker::default();
        tracker.observe(MONDAY + DAY_MS - 1);
        assert_eq!(tracker.observe(MONDAY + DAY_MS), vec![CalendarJobKind::Daily]);
    }

    #[test]
    fn sunday_to_monday_crosses_both() {
        let mut tracker = CalendarTracker::default();
        tracker.observe(MONDAY + 7 * DAY_MS - 1);
        assert_eq!(
            tracker.observe(MONDAY + 7 * DAY_MS),
            vec![CalendarJobKind::Daily, CalendarJobKind::Weekly]
        );
    }
}
