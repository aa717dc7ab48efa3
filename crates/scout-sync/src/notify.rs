use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("invalid e-mail address {0}")]
    Address(String),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound delivery channel. Best effort: a failure is reported once and
/// never retried.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them. Used when no
/// mail transport is configured.
#[derive(Debug, Clone)]
pub struct LogSink {
    from: String,
}

impl LogSink {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        info!(
            from = %self.from,
            to = %message.to,
            subject = %message.subject,
            text = %message.text,
            "alert e-mail (log only)"
        );
        Ok(())
    }
}
