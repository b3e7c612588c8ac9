// Notification dispatcher: renders alert messages and hands them to the gateway

pub mod log;
pub mod smtp;

pub use self::log::LogGateway;
pub use self::smtp::SmtpGateway;

use crate::errors::GatewayError;
use crate::evaluator::{DayCount, DueItem};
use crate::models::{MilestoneKind, TrackedPair};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// External messaging gateway (email in production)
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Deliver one message. `Ok` means the gateway accepted it.
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError>;

    /// Human-readable name for this channel (e.g., "smtp", "log")
    fn channel_name(&self) -> &'static str;
}

/// Everything needed to tell one user about one due milestone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertNotice {
    pub recipient: String,
    pub exam_name: String,
    pub institution: String,
    pub kind: MilestoneKind,
    pub milestone_date: NaiveDate,
    pub day_count: DayCount,
}

impl AlertNotice {
    pub fn new(pair: &TrackedPair, item: &DueItem) -> Self {
        Self {
            recipient: pair.contact.clone(),
            exam_name: pair.exam.name.clone(),
            institution: pair.exam.institution.clone(),
            kind: item.milestone.kind,
            milestone_date: item.milestone.date,
            day_count: item.day_count,
        }
    }
}

/// A subject/body pair ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Render the subject and body of an alert
pub fn render(notice: &AlertNotice) -> RenderedMessage {
    let label = notice.kind.label();
    let exam = format!("{} ({})", notice.exam_name, notice.institution);

    let subject = format!("Alert: {} - {}", label, exam);
    let body = match notice.day_count {
        DayCount::Today => format!(
            "Hello! The {} of {} is today. Date: {}.",
            label,
            exam,
            notice.milestone_date.format("%Y-%m-%d")
        ),
        DayCount::Days(_) => format!(
            "Hello! There are {} left until the {} of {}. Date: {}.",
            notice.day_count,
            label,
            exam,
            notice.milestone_date.format("%Y-%m-%d")
        ),
    };

    RenderedMessage { subject, body }
}

/// Formats alerts and sends them through the configured gateway
#[derive(Clone)]
pub struct NotificationDispatcher {
    gateway: Arc<dyn MessagingGateway>,
}

impl NotificationDispatcher {
    pub fn new(gateway: Arc<dyn MessagingGateway>) -> Self {
        Self { gateway }
    }

    pub fn channel_name(&self) -> &'static str {
        self.gateway.channel_name()
    }

    /// Render and send one alert.
    ///
    /// `Ok` is the confirmation that allows the ledger entry to be written;
    /// on `Err` the ledger must stay untouched so the next sweep retries.
    #[instrument(skip(self, notice), fields(
        channel = self.gateway.channel_name(),
        milestone = %notice.kind,
        day_count = %notice.day_count
    ))]
    pub async fn dispatch(&self, notice: &AlertNotice) -> Result<(), GatewayError> {
        let message = render(notice);
        self.gateway
            .send(&notice.recipient, &message.subject, &message.body)
            .await
    }
}
