//! Time source and next-fire computation for [`crate::domain::Schedule`].

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;

use crate::domain::ScheduleKind;
use crate::error::{OrchestratorError, Result};

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Computes the next fire time on or after `now`. Returns `None` for a
/// `OneShot` schedule (the caller disables it instead of rescheduling).
///
/// Interval schedules catch up from `last_fire_at` rather than from `now`:
/// `next_fire = max(now, last_fire_at.unwrap_or(now) + interval)`, so a
/// schedule that missed fires while the dispatcher was down does not drift
/// its cadence forward by the downtime.
pub fn compute_next_run(
    kind: &ScheduleKind,
    last_fire_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match kind {
        ScheduleKind::OneShot => Ok(None),
        ScheduleKind::Interval { seconds } => {
            if *seconds <= 0 {
                return Err(OrchestratorError::ValidationError(
                    "interval schedule must have seconds > 0".into(),
                ));
            }
            let base = last_fire_at.unwrap_or(now);
            let candidate = base + Duration::seconds(*seconds);
            Ok(Some(candidate.max(now)))
        }
        ScheduleKind::Cron { expression, timezone: _ } => {
            // Timezone offsets in original source were advisory display-only;
            // next-fire search runs in UTC, matching the dispatcher's clock.
            let schedule = CronSchedule::from_str(expression).map_err(|e| {
                OrchestratorError::ValidationError(format!("invalid cron expression: {e}"))
            })?;
            schedule
                .after(&now)
                .next()
                .map(Some)
                .ok_or_else(|| {
                    OrchestratorError::ValidationError("cron schedule has no future fires".into())
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_advances_by_fixed_seconds() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = compute_next_run(&ScheduleKind::Interval { seconds: 60 }, None, at)
            .unwrap()
            .unwrap();
        assert_eq!(next, at + Duration::seconds(60));
    }

    #[test]
    fn interval_catches_up_from_last_fire_not_from_now() {
        let last_fire = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = last_fire + Duration::seconds(30);
        let next = compute_next_run(&ScheduleKind::Interval { seconds: 60 }, Some(last_fire), now)
            .unwrap()
            .unwrap();
        assert_eq!(next, last_fire + Duration::seconds(60));
    }

    #[test]
    fn interval_never_schedules_in_the_past() {
        let last_fire = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let now = last_fire + Duration::seconds(600);
        let next = compute_next_run(&ScheduleKind::Interval { seconds: 60 }, Some(last_fire), now)
            .unwrap()
            .unwrap();
        assert_eq!(next, now);
    }

    #[test]
    fn one_shot_has_no_next_run() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(compute_next_run(&ScheduleKind::OneShot, None, at).unwrap().is_none());
    }

    #[test]
    fn cron_advances_to_next_matching_minute() {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = compute_next_run(
            &ScheduleKind::Cron {
                expression: "0 */5 * * * *".into(),
                timezone: "UTC".into(),
            },
            None,
            at,
        )
        .unwrap()
        .unwrap();
        assert!(next > at);
    }
}
