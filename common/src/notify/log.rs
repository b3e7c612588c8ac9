// Log-based gateway for dry runs

use super::MessagingGateway;
use crate::errors::GatewayError;
use async_trait::async_trait;

/// Logs every message at INFO and reports success.
///
/// Used when `smtp.dry_run` is set, so the engine (and its ledger) can be
/// exercised end to end without an SMTP relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGateway;

#[async_trait]
impl MessagingGateway for LogGateway {
    #[tracing::instrument(skip(self, body))]
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError> {
        tracing::info!(to = to, subject = subject, body = body, "Alert message (dry run)");
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "log"
    }
}
