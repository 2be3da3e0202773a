//! Email delivery handler.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use courier_core::{DomainError, DomainResult, QueueConfig};

use crate::envelope::Envelope;
use crate::handler::{Handler, HandlerError, HandlerResult, QueueBinding};

/// Envelope type for outgoing email.
pub const SEND_EMAIL: &str = "email.send";

/// Email payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub is_html: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl EmailMessage {
    pub fn new(to: Vec<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to,
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            is_html: false,
            headers: BTreeMap::new(),
        }
    }

    pub fn html(mut self, is_html: bool) -> Self {
        self.is_html = is_html;
        self
    }

    pub fn with_cc(mut self, cc: Vec<String>) -> Self {
        self.cc = cc;
        self
    }

    pub fn with_bcc(mut self, bcc: Vec<String>) -> Self {
        self.bcc = bcc;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// At least one recipient, non-blank subject and body, and every
    /// to/cc/bcc address syntactically valid.
    pub fn validate(&self) -> DomainResult<()> {
        if self.to.is_empty() {
            return Err(DomainError::validation("recipient list cannot be empty"));
        }
        if self.subject.trim().is_empty() {
            return Err(DomainError::validation("email subject cannot be empty"));
        }
        if self.body.trim().is_empty() {
            return Err(DomainError::validation("email body cannot be empty"));
        }

        for address in self.to.iter().chain(&self.cc).chain(&self.bcc) {
            if !is_valid_address(address) {
                return Err(DomainError::validation(format!(
                    "invalid email address: {address}"
                )));
            }
        }
        Ok(())
    }
}

/// `local@domain.tld`: one `@`, no whitespace, dotted domain.
fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') || address.chars().any(char::is_whitespace) {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MailerError {
    #[error("mail transport error: {0}")]
    Transport(String),

    #[error("message rejected by mail server: {0}")]
    Rejected(String),
}

/// Outbound mail transport.
pub trait Mailer: Send + Sync {
    fn send(&self, message: &EmailMessage) -> Result<(), MailerError>;
}

/// Logs instead of sending, after an optional artificial latency.
#[derive(Debug, Clone)]
pub struct LogMailer {
    latency: Duration,
}

impl Default for LogMailer {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl LogMailer {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Mailer for LogMailer {
    fn send(&self, message: &EmailMessage) -> Result<(), MailerError> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        debug!(
            to = ?message.to,
            cc = message.cc.len(),
            bcc = message.bcc.len(),
            subject = %message.subject,
            is_html = message.is_html,
            "email sent (log transport)"
        );
        Ok(())
    }
}

/// Decodes an [`EmailMessage`], validates it and hands it to a [`Mailer`].
pub struct EmailHandler {
    binding: QueueBinding,
    mailer: Arc<dyn Mailer>,
}

impl core::fmt::Debug for EmailHandler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EmailHandler")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl EmailHandler {
    pub fn new(binding: QueueBinding, mailer: Arc<dyn Mailer>) -> Self {
        Self { binding, mailer }
    }

    pub fn from_config(config: &QueueConfig, mailer: Arc<dyn Mailer>) -> Self {
        Self::new(QueueBinding::from_config(config), mailer)
    }
}

impl Handler for EmailHandler {
    fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    fn handle(&self, envelope: &Envelope) -> HandlerResult {
        debug!(
            queue = %self.binding.queue_name(),
            message_id = %envelope.id(),
            message_type = %envelope.kind(),
            "processing email"
        );

        let message: EmailMessage = envelope.decode_payload()?;
        message.validate()?;
        self.mailer
            .send(&message)
            .map_err(|e| HandlerError::failed(e.to_string()))?;

        info!(
            queue = %self.binding.queue_name(),
            message_id = %envelope.id(),
            to = ?message.to,
            subject = %message.subject,
            "email delivered"
        );
        Ok(())
    }
}
