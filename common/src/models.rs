use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Exam Models
// ============================================================================

/// Exam is an institution-level record with up to ten milestone dates.
///
/// Dates are kept as the raw `YYYY-MM-DD` text they were stored with; the
/// milestone catalog parses and validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Exam {
    pub id: i64,
    pub name: String,
    pub institution: String,
    pub start_registration: Option<String>,
    pub end_registration: Option<String>,
    pub payment_deadline: Option<String>,
    pub exemption_deadline: Option<String>,
    pub first_phase_date: Option<String>,
    pub second_phase_date: Option<String>,
    pub results_date: Option<String>,
    pub first_call_date: Option<String>,
    pub enrollment_date: Option<String>,
    pub second_call_date: Option<String>,
}

impl Exam {
    /// Create an exam with no milestone dates
    pub fn new(id: i64, name: impl Into<String>, institution: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            institution: institution.into(),
            ..Default::default()
        }
    }

    /// Set the date of a milestone, returning the updated exam
    pub fn with_milestone(mut self, kind: MilestoneKind, date: impl Into<String>) -> Self {
        *self.milestone_field_mut(kind) = Some(date.into());
        self
    }

    /// Raw date text stored for a milestone kind, if any.
    ///
    /// Blank text counts as absent.
    pub fn milestone_field(&self, kind: MilestoneKind) -> Option<&str> {
        let field = match kind {
            MilestoneKind::StartRegistration => &self.start_registration,
            MilestoneKind::EndRegistration => &self.end_registration,
            MilestoneKind::PaymentDeadline => &self.payment_deadline,
            MilestoneKind::ExemptionDeadline => &self.exemption_deadline,
            MilestoneKind::FirstPhase => &self.first_phase_date,
            MilestoneKind::SecondPhase => &self.second_phase_date,
            MilestoneKind::Results => &self.results_date,
            MilestoneKind::FirstCall => &self.first_call_date,
            MilestoneKind::Enrollment => &self.enrollment_date,
            MilestoneKind::SecondCall => &self.second_call_date,
        };
        field.as_deref().map(str::trim).filter(|raw| !raw.is_empty())
    }

    fn milestone_field_mut(&mut self, kind: MilestoneKind) -> &mut Option<String> {
        match kind {
            MilestoneKind::StartRegistration => &mut self.start_registration,
            MilestoneKind::EndRegistration => &mut self.end_registration,
            MilestoneKind::PaymentDeadline => &mut self.payment_deadline,
            MilestoneKind::ExemptionDeadline => &mut self.exemption_deadline,
            MilestoneKind::FirstPhase => &mut self.first_phase_date,
            MilestoneKind::SecondPhase => &mut self.second_phase_date,
            MilestoneKind::Results => &mut self.results_date,
            MilestoneKind::FirstCall => &mut self.first_call_date,
            MilestoneKind::Enrollment => &mut self.enrollment_date,
            MilestoneKind::SecondCall => &mut self.second_call_date,
        }
    }
}

/// MilestoneKind names one of the dated phases of an exam
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneKind {
    StartRegistration,
    EndRegistration,
    PaymentDeadline,
    ExemptionDeadline,
    FirstPhase,
    SecondPhase,
    Results,
    FirstCall,
    Enrollment,
    SecondCall,
}

impl MilestoneKind {
    /// Every kind, in catalog order
    pub const ALL: [MilestoneKind; 10] = [
        MilestoneKind::StartRegistration,
        MilestoneKind::EndRegistration,
        MilestoneKind::PaymentDeadline,
        MilestoneKind::ExemptionDeadline,
        MilestoneKind::FirstPhase,
        MilestoneKind::SecondPhase,
        MilestoneKind::Results,
        MilestoneKind::FirstCall,
        MilestoneKind::Enrollment,
        MilestoneKind::SecondCall,
    ];

    /// Stable identifier used in ledger keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneKind::StartRegistration => "start_registration",
            MilestoneKind::EndRegistration => "end_registration",
            MilestoneKind::PaymentDeadline => "payment_deadline",
            MilestoneKind::ExemptionDeadline => "exemption_deadline",
            MilestoneKind::FirstPhase => "first_phase",
            MilestoneKind::SecondPhase => "second_phase",
            MilestoneKind::Results => "results",
            MilestoneKind::FirstCall => "first_call",
            MilestoneKind::Enrollment => "enrollment",
            MilestoneKind::SecondCall => "second_call",
        }
    }

    /// Human-readable label used in notifications
    pub fn label(&self) -> &'static str {
        match self {
            MilestoneKind::StartRegistration => "Registration Opening",
            MilestoneKind::EndRegistration => "Registration Deadline",
            MilestoneKind::PaymentDeadline => "Payment Deadline",
            MilestoneKind::ExemptionDeadline => "Fee Waiver Deadline",
            MilestoneKind::FirstPhase => "First Phase",
            MilestoneKind::SecondPhase => "Second Phase",
            MilestoneKind::Results => "Results",
            MilestoneKind::FirstCall => "First Call",
            MilestoneKind::Enrollment => "Enrollment",
            MilestoneKind::SecondCall => "Second Call",
        }
    }
}

impl fmt::Display for MilestoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MilestoneKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MilestoneKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("Invalid milestone kind: {}", s))
    }
}

/// MilestoneInstance is a derived (exam, kind, date) triple. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MilestoneInstance {
    pub exam_id: i64,
    pub kind: MilestoneKind,
    pub date: NaiveDate,
}

// ============================================================================
// Subscription Models
// ============================================================================

/// TrackedPair is one subscription joined with its user contact and exam
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPair {
    pub user_id: i64,
    pub contact: String,
    pub exam: Exam,
}

impl TrackedPair {
    pub fn new(user_id: i64, contact: impl Into<String>, exam: Exam) -> Self {
        Self {
            user_id,
            contact: contact.into(),
            exam,
        }
    }
}

// ============================================================================
// Dispatch Models
// ============================================================================

/// DispatchKey identifies exactly one notification that may ever be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchKey {
    pub user_id: i64,
    pub exam_id: i64,
    pub kind: MilestoneKind,
    pub offset_days: u32,
    pub milestone_date: NaiveDate,
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.user_id, self.exam_id, self.kind, self.offset_days, self.milestone_date
        )
    }
}

/// DispatchTrigger records which path produced a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchTrigger {
    Sweep,
    Timer,
    Subscription,
}

impl fmt::Display for DispatchTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchTrigger::Sweep => write!(f, "sweep"),
            DispatchTrigger::Timer => write!(f, "timer"),
            DispatchTrigger::Subscription => write!(f, "subscription"),
        }
    }
}

impl FromStr for DispatchTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sweep" => Ok(DispatchTrigger::Sweep),
            "timer" => Ok(DispatchTrigger::Timer),
            "subscription" => Ok(DispatchTrigger::Subscription),
            _ => Err(format!("Invalid dispatch trigger: {}", s)),
        }
    }
}

/// DispatchRecord is the immutable proof that a notification was sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: Uuid,
    pub key: DispatchKey,
    pub recipient: String,
    pub trigger: DispatchTrigger,
    pub sent_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn new(
        key: DispatchKey,
        recipient: impl Into<String>,
        trigger: DispatchTrigger,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            recipient: recipient.into(),
            trigger,
            sent_at,
        }
    }
}
