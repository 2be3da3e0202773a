//! Startup wiring of the built-in queues to their handlers.

use std::sync::Arc;

use tracing::info;

use courier_core::QueueSettings;

use crate::email::{EmailHandler, Mailer};
use crate::error::{QueueError, QueueResult};
use crate::manager::QueueManager;

/// Logical name of the outgoing email queue.
pub const EMAIL_QUEUE: &str = "email";

/// Register every built-in handler with `manager`.
///
/// Fails when a built-in queue has no configuration entry.
pub fn register_queue_handlers(
    manager: &QueueManager,
    settings: &QueueSettings,
    mailer: Arc<dyn Mailer>,
) -> QueueResult<()> {
    let email = settings
        .queue_config(EMAIL_QUEUE)
        .ok_or_else(|| QueueError::UnknownConfig(EMAIL_QUEUE.to_string()))?;
    manager.register_handler(Arc::new(EmailHandler::from_config(&email, mailer)))?;
    info!(queue = EMAIL_QUEUE, broker_queue = %email.broker_name, "email queue registered");

    info!(queues = ?manager.registered_queues(), "queue handlers registered");
    Ok(())
}
