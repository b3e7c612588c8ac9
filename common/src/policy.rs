// Lead-time policy: the fixed day offsets at which a milestone triggers an alert

use chrono::NaiveDate;

/// Day offsets before a milestone at which a notification is due.
/// Offset 0 means the milestone is today.
pub const LEAD_TIMES_DAYS: [u32; 9] = [30, 20, 15, 10, 7, 3, 2, 1, 0];

/// Whole days from `today` until `milestone_date`. Negative once the date has passed.
///
/// Both operands are calendar dates already normalized to the engine time zone.
#[inline]
pub fn days_until(milestone_date: NaiveDate, today: NaiveDate) -> i64 {
    (milestone_date - today).num_days()
}

/// Return the matching lead-time offset if a notification is due today
pub fn is_due(milestone_date: NaiveDate, today: NaiveDate) -> Option<u32> {
    let days = days_until(milestone_date, today);
    let days = u32::try_from(days).ok()?;
    is_lead_time(days).then_some(days)
}

/// Check whether an offset belongs to the policy
#[inline]
pub fn is_lead_time(offset_days: u32) -> bool {
    LEAD_TIMES_DAYS.contains(&offset_days)
}
