// Due-event evaluator: filters milestones down to the ones due today

use crate::catalog;
use crate::errors::CatalogError;
use crate::models::{DispatchKey, MilestoneInstance, TrackedPair};
use crate::policy;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Human-facing count of days left until a milestone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayCount {
    Today,
    Days(u32),
}

impl DayCount {
    pub fn from_offset(offset_days: u32) -> Self {
        match offset_days {
            0 => DayCount::Today,
            n => DayCount::Days(n),
        }
    }
}

impl fmt::Display for DayCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayCount::Today => write!(f, "today"),
            DayCount::Days(n) => write!(f, "{} day(s)", n),
        }
    }
}

/// A milestone that is due today, with its matching lead-time offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueItem {
    pub milestone: MilestoneInstance,
    pub offset_days: u32,
    pub day_count: DayCount,
}

impl DueItem {
    /// Ledger key for delivering this item to a given user
    pub fn dispatch_key(&self, user_id: i64) -> DispatchKey {
        DispatchKey {
            user_id,
            exam_id: self.milestone.exam_id,
            kind: self.milestone.kind,
            offset_days: self.offset_days,
            milestone_date: self.milestone.date,
        }
    }
}

/// Evaluate which milestones are due on `today`, preserving input order
pub fn evaluate(today: NaiveDate, milestones: &[MilestoneInstance]) -> Vec<DueItem> {
    milestones
        .iter()
        .filter_map(|milestone| {
            policy::is_due(milestone.date, today).map(|offset_days| DueItem {
                milestone: *milestone,
                offset_days,
                day_count: DayCount::from_offset(offset_days),
            })
        })
        .collect()
}

/// Expand a tracked pair's exam and evaluate it for `today`.
///
/// Returns the due items together with any malformed milestone dates found.
pub fn evaluate_pair(today: NaiveDate, pair: &TrackedPair) -> (Vec<DueItem>, Vec<CatalogError>) {
    let (milestones, invalid) = catalog::milestones(&pair.exam);
    (evaluate(today, &milestones), invalid)
}
