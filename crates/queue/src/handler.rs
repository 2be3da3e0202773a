//! Handler contract: the unit of work a queue executes.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use courier_core::{DomainError, QueueConfig};

use crate::envelope::{Envelope, EnvelopeError};

/// Result of one handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

/// Processing failure. Every variant is retried up to the queue's retry limit.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] EnvelopeError),

    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("handler failed: {0}")]
    Failed(String),

    /// The handler panicked; the panic was caught at the invocation boundary.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Logical queue identity plus desired concurrency, shared by every handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    queue_name: String,
    num_consumers: usize,
    prefetch_limit: usize,
}

impl QueueBinding {
    pub fn new(queue_name: impl Into<String>, num_consumers: usize, prefetch_limit: usize) -> Self {
        Self {
            queue_name: queue_name.into(),
            num_consumers,
            prefetch_limit,
        }
    }

    /// Bind to a resolved queue policy (logical name, consumers, prefetch).
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(
            config.logical_name.clone(),
            config.num_consumers,
            config.prefetch_limit,
        )
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn num_consumers(&self) -> usize {
        self.num_consumers
    }

    pub fn prefetch_limit(&self) -> usize {
        self.prefetch_limit
    }
}

/// A unit of work for one queue.
///
/// `handle` is called concurrently from every consumer worker of the queue, so
/// implementations must be `Send + Sync` and should be idempotent: delivery is
/// at-least-once. Panics inside `handle` are caught by the consumer and count
/// as a failed attempt.
pub trait Handler: Send + Sync {
    /// Queue identity and concurrency this handler was built with.
    fn binding(&self) -> &QueueBinding;

    /// Process one decoded message.
    fn handle(&self, envelope: &Envelope) -> HandlerResult;

    fn queue_name(&self) -> &str {
        self.binding().queue_name()
    }

    fn num_consumers(&self) -> usize {
        self.binding().num_consumers()
    }

    fn prefetch_limit(&self) -> usize {
        self.binding().prefetch_limit()
    }
}

impl<H> Handler for Arc<H>
where
    H: Handler + ?Sized,
{
    fn binding(&self) -> &QueueBinding {
        (**self).binding()
    }

    fn handle(&self, envelope: &Envelope) -> HandlerResult {
        (**self).handle(envelope)
    }
}

/// Handler that accepts every message. Useful as a drain for queues whose
/// consumers are not implemented yet.
#[derive(Debug, Clone)]
pub struct NoopHandler {
    binding: QueueBinding,
}

impl NoopHandler {
    pub fn new(binding: QueueBinding) -> Self {
        Self { binding }
    }
}

impl Handler for NoopHandler {
    fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    fn handle(&self, envelope: &Envelope) -> HandlerResult {
        debug!(
            queue = %self.binding.queue_name(),
            message_id = %envelope.id(),
            message_type = %envelope.kind(),
            "message discarded by no-op handler"
        );
        Ok(())
    }
}

/// Closure-backed handler.
pub struct FnHandler<F> {
    binding: QueueBinding,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Envelope) -> HandlerResult + Send + Sync,
{
    pub fn new(binding: QueueBinding, f: F) -> Self {
        Self { binding, f }
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Envelope) -> HandlerResult + Send + Sync,
{
    fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    fn handle(&self, envelope: &Envelope) -> HandlerResult {
        (self.f)(envelope)
    }
}
