//! Broker-backed asynchronous job queue.
//!
//! ## Design
//!
//! - Producers publish typed payloads wrapped in an [`Envelope`] to a named queue
//! - The broker hands deliveries to consumer workers, at most `prefetch_limit`
//!   unacknowledged at a time per queue
//! - Each delivery is decoded and passed to the queue's [`Handler`]
//! - Failures are retried by republishing after `retry_delay`, up to
//!   `retry_limit`; then the delivery is rejected
//! - Delivery is at-least-once: handlers must be idempotent
//!
//! ## Components
//!
//! - `Envelope`: wire message and its JSON codec
//! - `Handler`: unit of work bound to one queue
//! - `Broker`: collaborator interface (in-memory and Redis implementations)
//! - `Consumer`: delivery → handler adapter with ack/retry/reject policy
//! - `RetryScheduler`: delayed republish of failed envelopes
//! - `QueueManager`: owns the broker, registrations, publishing and shutdown

pub mod broker;
pub mod consumer;
pub mod email;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod manager;
pub mod registration;
pub mod retry;

pub use broker::in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use broker::redis::RedisBroker;
pub use broker::{
    Broker, BrokerError, BrokerQueue, Delivery, DeliveryConsumer, QueueStats, StopHandle,
};
pub use consumer::{Consumer, ConsumerStats};
pub use email::{EmailHandler, EmailMessage, LogMailer, Mailer, MailerError, SEND_EMAIL};
pub use envelope::{Envelope, EnvelopeError, EnvelopeId};
pub use error::{QueueError, QueueResult};
pub use handler::{FnHandler, Handler, HandlerError, HandlerResult, NoopHandler, QueueBinding};
pub use manager::QueueManager;
pub use registration::{EMAIL_QUEUE, register_queue_handlers};
pub use retry::{PendingRetry, Republish, RetryScheduler};
