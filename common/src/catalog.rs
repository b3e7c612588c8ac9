// Milestone catalog: expands an exam record into dated milestones

use crate::errors::CatalogError;
use crate::models::{Exam, MilestoneInstance, MilestoneKind};
use chrono::NaiveDate;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Expand an exam into one entry per populated milestone field, in catalog order.
///
/// Absent or blank fields are skipped. A populated field that is not a valid
/// `YYYY-MM-DD` date (optionally followed by a time part, which is dropped)
/// yields `CatalogError::InvalidMilestoneDate` in its slot; the caller decides
/// how to report it.
pub fn expand(exam: &Exam) -> Vec<Result<MilestoneInstance, CatalogError>> {
    MilestoneKind::ALL
        .into_iter()
        .filter_map(|kind| {
            exam.milestone_field(kind)
                .map(|raw| parse_milestone(exam.id, kind, raw))
        })
        .collect()
}

/// Expand an exam and split valid milestones from malformed ones
pub fn milestones(exam: &Exam) -> (Vec<MilestoneInstance>, Vec<CatalogError>) {
    let mut valid = Vec::new();
    let mut invalid = Vec::new();

    for entry in expand(exam) {
        match entry {
            Ok(milestone) => valid.push(milestone),
            Err(e) => invalid.push(e),
        }
    }

    (valid, invalid)
}

fn parse_milestone(
    exam_id: i64,
    kind: MilestoneKind,
    raw: &str,
) -> Result<MilestoneInstance, CatalogError> {
    let invalid = || CatalogError::InvalidMilestoneDate {
        exam_id,
        kind,
        value: raw.to_string(),
    };

    let trimmed = raw.trim();
    let date_part = match trimmed.char_indices().nth(10) {
        Some((idx, 'T')) | Some((idx, ' ')) => &trimmed[..idx],
        Some(_) => return Err(invalid()),
        None => trimmed,
    };

    let date = NaiveDate::parse_from_str(date_part, DATE_FORMAT).map_err(|_| invalid())?;

    Ok(MilestoneInstance {
        exam_id,
        kind,
        date,
    })
}
