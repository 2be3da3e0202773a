//! Outgoing email producer.

use std::sync::Arc;

use courier_queue::{
    EMAIL_QUEUE, EmailMessage, EnvelopeId, QueueError, QueueManager, SEND_EMAIL,
};

use crate::runtime;

#[derive(Debug, thiserror::Error)]
pub enum EmailServiceError {
    #[error("queue manager not initialised")]
    NotInitialized,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Enqueues `email.send` messages on the email queue. Delivery happens
/// asynchronously in the email handler.
#[derive(Debug, Clone)]
pub struct EmailService {
    manager: Arc<QueueManager>,
}

impl EmailService {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        Self { manager }
    }

    /// Bind to the process-wide manager.
    pub fn from_runtime() -> Result<Self, EmailServiceError> {
        runtime::manager()
            .map(Self::new)
            .ok_or(EmailServiceError::NotInitialized)
    }

    pub fn send_email(
        &self,
        to: Vec<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        is_html: bool,
    ) -> Result<EnvelopeId, EmailServiceError> {
        self.send(&EmailMessage::new(to, subject, body).html(is_html))
    }

    pub fn send(&self, message: &EmailMessage) -> Result<EnvelopeId, EmailServiceError> {
        let id = self.manager.publish_payload(EMAIL_QUEUE, SEND_EMAIL, message)?;
        tracing::debug!(message_id = %id, to = ?message.to, "email queued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::QueueSettings;
    use courier_queue::{InMemoryBroker, Mailer, MailerError, register_queue_handlers};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<EmailMessage>>,
    }

    impl Mailer for RecordingMailer {
        fn send(&self, message: &EmailMessage) -> Result<(), MailerError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn send_email_reaches_the_email_handler() {
        let broker = Arc::new(InMemoryBroker::new());
        let settings = QueueSettings::default();
        let manager = QueueManager::open(settings.clone(), broker.clone()).unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        register_queue_handlers(&manager, &settings, mailer.clone()).unwrap();

        EmailService::new(manager.clone())
            .send_email(vec!["a@x.com".to_string()], "Welcome", "<b>hi</b>", true)
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while mailer.sent.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let sent = mailer.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![EmailMessage::new(vec!["a@x.com".to_string()], "Welcome", "<b>hi</b>").html(true)]
        );
        assert_eq!(broker.queue("email_queue").unwrap().published_count(), 1);
        manager.close().unwrap();
    }

    #[test]
    fn send_without_registered_email_queue_fails() {
        let manager =
            QueueManager::open(QueueSettings::default(), Arc::new(InMemoryBroker::new())).unwrap();
        let service = EmailService::new(manager);

        let err = service
            .send(&EmailMessage::new(vec!["a@x.com".to_string()], "s", "b"))
            .unwrap_err();
        assert!(matches!(err, EmailServiceError::Queue(QueueError::UnknownQueue(_))));
    }
}
