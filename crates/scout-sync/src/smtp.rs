//! SMTP delivery for alert e-mails.

use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info};

use crate::config::ScoutConfig;
use crate::notify::{LogSink, NotificationSink, NotifyError, OutboundMessage};

/// Port on which the relay expects TLS from the first byte; any other port
/// upgrades with STARTTLS.
pub const IMPLICIT_TLS_PORT: u16 = 465;
pub const DEFAULT_SMTP_PORT: u16 = 587;

#[derive(Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

pub struct SmtpSink {
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSink {
    /// Build the transport. No connection is made until the first send.
    pub fn new(settings: &SmtpSettings, from: &str) -> Result<Self, NotifyError> {
        let from = parse_mailbox(from)?;
        let relay = if settings.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|err| NotifyError::Transport(err.to_string()))?;

        let transport = relay
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();
        Ok(Self { from, transport })
    }

    fn compose(&self, message: &OutboundMessage) -> Result<Message, NotifyError> {
        Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(&message.to)?)
            .subject(message.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(
                message.text.clone(),
                message.html.clone(),
            ))
            .map_err(|err| NotifyError::Transport(err.to_string()))
    }
}

fn parse_mailbox(raw: &str) -> Result<Mailbox, NotifyError> {
    raw.trim()
        .parse()
        .map_err(|err| NotifyError::Address(format!("{raw}: {err}")))
}

#[async_trait]
impl NotificationSink for SmtpSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        let email = self.compose(message)?;
        self.transport
            .send(email)
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        debug!(to = %message.to, subject = %message.subject, "alert e-mail delivered");
        Ok(())
    }
}

/// SMTP when the relay is configured, the log otherwise.
pub fn sink_from_config(config: &ScoutConfig) -> Result<Arc<dyn NotificationSink>, NotifyError> {
    match &config.smtp {
        Some(settings) => {
            let sink = SmtpSink::new(settings, &config.alert_from_email)?;
            info!(host = %settings.host, port = settings.port, "alert e-mails go out over SMTP");
            Ok(Arc::new(sink))
        }
        None => {
            info!("SMTP not configured; alert e-mails are only logged");
            Ok(Arc::new(LogSink::new(config.alert_from_email.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(port: u16) -> SmtpSettings {
        SmtpSettings {
            host: "smtp.example.com".into(),
            port,
            username: "scout".into(),
            password: "hunter2".into(),
        }
    }

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.into(),
            subject: "Price alert: Elite Trainer Box".into(),
            html: "<p>Now <b>8 000 Ft</b></p>".into(),
            text: "Now 8 000 Ft".into(),
        }
    }

    #[tokio::test]
    async fn composes_plain_and_html_alternatives() {
        let sink = SmtpSink::new(&settings(DEFAULT_SMTP_PORT), "Scout <alerts@example.com>").unwrap();
        let email = sink.compose(&message("ash@example.com")).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(raw.contains("alerts@example.com"));
        assert!(raw.contains("ash@example.com"));
        assert!(raw.contains("Subject: Price alert: Elite Trainer Box"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
    }

    #[tokio::test]
    async fn bad_addresses_are_reported_before_sending() {
        assert!(matches!(
            SmtpSink::new(&settings(IMPLICIT_TLS_PORT), "not an address"),
            Err(NotifyError::Address(_))
        ));

        let sink = SmtpSink::new(&settings(DEFAULT_SMTP_PORT), "alerts@example.com").unwrap();
        assert!(matches!(
            sink.send(&message("nobody")).await,
            Err(NotifyError::Address(_))
        ));
    }

    #[test]
    fn password_stays_out_of_debug_output() {
        let shown = format!("{:?}", settings(DEFAULT_SMTP_PORT));
        assert!(shown.contains("smtp.example.com"));
        assert!(!shown.contains("hunter2"));
    }
}
