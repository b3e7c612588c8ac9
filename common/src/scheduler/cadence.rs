// Sweep cadence and timer instants

use crate::errors::ScheduleError;
use chrono::{DateTime, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Parse a cron expression with second precision (`sec min hour dom mon dow [year]`)
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next sweep instant strictly after `now`, evaluated in `timezone`
pub fn next_sweep_after(
    schedule: &CronSchedule,
    timezone: Tz,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, ScheduleError> {
    let reference = now.with_timezone(&timezone);
    schedule
        .after(&reference)
        .next()
        .map(|next| next.with_timezone(&Utc))
        .ok_or_else(|| ScheduleError::NoNextExecution {
            expression: schedule.to_string(),
        })
}

/// Instant at which the one-shot timer for `offset_days` before `milestone_date` fires.
///
/// Returns `None` when the local time does not exist (DST gap) or the date
/// underflows.
pub fn timer_fire_at(
    milestone_date: NaiveDate,
    offset_days: u32,
    time_of_day: NaiveTime,
    timezone: Tz,
) -> Option<DateTime<Utc>> {
    let fire_date = milestone_date.checked_sub_days(Days::new(u64::from(offset_days)))?;
    timezone
        .from_local_datetime(&fire_date.and_time(time_of_day))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
