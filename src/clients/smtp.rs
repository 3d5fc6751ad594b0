use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};

use crate::config::Config;

/// Outbound mail seam. The delivery policy only sees this trait, so tests can
/// substitute an in-memory transport.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Address used as From and, for BCC batches, as the visible To.
    fn sender(&self) -> &str;

    /// One transport call: a single authenticated SMTP session.
    async fn send(&self, to: &str, bcc: &[String], subject: &str, html: &str)
    -> Result<(), Error>;
}

/// lettre-backed SMTP transport, STARTTLS when configured.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: String,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let credentials =
            Credentials::new(config.smtp_user.clone(), config.smtp_password.clone());

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
            .port(config.smtp_port)
            .credentials(credentials);

        if config.smtp_use_tls {
            let tls = TlsParameters::new(config.smtp_host.clone())
                .map_err(|e| anyhow!("Invalid TLS parameters for {}: {e}", config.smtp_host))?;
            builder = builder.tls(Tls::Required(tls));
        }

        Ok(Self {
            transport: builder.build(),
            sender: config.smtp_user.clone(),
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    fn sender(&self) -> &str {
        &self.sender
    }

    async fn send(
        &self,
        to: &str,
        bcc: &[String],
        subject: &str,
        html: &str,
    ) -> Result<(), Error> {
        let mut builder = Message::builder()
            .from(parse_mailbox(&self.sender)?)
            .to(parse_mailbox(to)?)
            .subject(subject)
            .header(ContentType::TEXT_HTML);

        for address in bcc {
            builder = builder.bcc(parse_mailbox(address)?);
        }

        let message = builder
            .body(html.to_string())
            .map_err(|e| anyhow!("Failed to build message: {e}"))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| anyhow!("SMTP send failed: {e}"))?;

        Ok(())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, Error> {
    address
        .parse::<Mailbox>()
        .map_err(|e| anyhow!("Invalid email address '{address}': {e}"))
}
