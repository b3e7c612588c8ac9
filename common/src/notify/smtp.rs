// SMTP messaging gateway via `lettre`

use super::MessagingGateway;
use crate::config::{SmtpConfig, SmtpTls};
use crate::errors::GatewayError;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;
use tracing::{info, instrument};

/// Sends alert emails through an SMTP relay
#[derive(Debug)]
pub struct SmtpGateway {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpGateway {
    /// Build the gateway from SMTP configuration.
    ///
    /// `Implicit` TLS wraps the connection from the first byte (usually port
    /// 465), `Starttls` upgrades a plain connection (usually 587), `None`
    /// never encrypts and is only meant for local relays.
    pub fn from_config(config: &SmtpConfig) -> Result<Self, GatewayError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e: lettre::address::AddressError| GatewayError::Config(e.to_string()))?;

        let builder = match config.tls {
            SmtpTls::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| GatewayError::Config(e.to_string()))?,
            SmtpTls::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| GatewayError::Config(e.to_string()))?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        let mut builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_seconds)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        info!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            "SMTP gateway configured"
        );

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl MessagingGateway for SmtpGateway {
    #[instrument(skip(self, subject, body))]
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), GatewayError> {
        let recipient: Mailbox =
            to.parse()
                .map_err(|e: lettre::address::AddressError| GatewayError::InvalidAddress {
                    address: to.to_string(),
                    reason: e.to_string(),
                })?;

        let email = Message::builder()
            .from(self.from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;

        self.transport.send(email).await.map_err(|e| {
            if e.is_permanent() {
                GatewayError::Rejected(e.to_string())
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;

        info!("Alert email accepted by SMTP relay");
        Ok(())
    }

    fn channel_name(&self) -> &'static str {
        "smtp"
    }
}
