//! Broker collaborator interface.
//!
//! A broker is a durable queue store offering publish, prefetch-bounded
//! consumption, acknowledgment and rejection. Anything providing this
//! capability set can back the queue manager:
//!
//! ```text
//! Broker ──open_queue──► BrokerQueue ──start_consuming(prefetch, poll)
//!                            │         └─add_consumer(tag, consumer)
//!                            ▼
//!                      Delivery (payload, ack, reject) ──► DeliveryConsumer
//! ```
//!
//! ## Delivery guarantees
//!
//! - A fetched message stays in the broker's unacked set until it is acked or
//!   rejected
//! - At most `prefetch_limit` deliveries of a queue are unacked in this
//!   process at any instant
//! - No ordering guarantee between concurrently processed deliveries

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

mod group;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub(crate) use group::{ConsumerGroup, DeliverySource};
pub use group::StopHandle;

/// Broker error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("queue {0} is already consuming")]
    AlreadyConsuming(String),

    #[error("queue {0} is not consuming")]
    NotConsuming(String),

    #[error("invalid consume option: {0}")]
    InvalidOption(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Broker-reported counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    /// Messages waiting to be fetched.
    pub ready: u64,
    /// Fetched but not yet acknowledged or rejected.
    pub unacked: u64,
    /// Terminally rejected messages kept by the broker.
    pub rejected: u64,
    /// Consumer workers attached in this process.
    pub consumers: usize,
}

/// One broker-issued attempt to hand a message to a consumer.
///
/// Exactly one of `ack` / `reject` should be called. A delivery dropped without
/// either stays unacked in the broker.
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// Remove the message permanently.
    fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Move the message to the queue's rejected list.
    fn reject(self: Box<Self>) -> Result<(), BrokerError>;
}

/// Callback invoked by consumer workers, once per delivery.
pub trait DeliveryConsumer: Send + Sync {
    fn consume(&self, delivery: Box<dyn Delivery>);
}

/// A named queue opened on a broker connection.
pub trait BrokerQueue: Send + Sync {
    /// Broker-side queue name.
    fn name(&self) -> &str;

    /// Append a message to the ready list.
    fn publish(&self, payload: &[u8]) -> Result<(), BrokerError>;

    /// Begin fetching ready messages, keeping at most `prefetch_limit` unacked
    /// and polling every `poll_interval` when the queue is empty.
    fn start_consuming(
        &self,
        prefetch_limit: usize,
        poll_interval: Duration,
    ) -> Result<(), BrokerError>;

    /// Attach one worker that hands deliveries to `consumer`. Returns the
    /// worker name.
    fn add_consumer(
        &self,
        tag: &str,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<String, BrokerError>;

    /// Stop fetching. The returned handle completes once the workers have
    /// processed every delivery already fetched and exited.
    fn stop_consuming(&self) -> StopHandle;
}

/// A live broker connection.
pub trait Broker: Send + Sync {
    /// Round-trip check bounded by `timeout`.
    fn ping(&self, timeout: Duration) -> Result<(), BrokerError>;

    /// Open (or create) a queue by broker-side name.
    fn open_queue(&self, name: &str) -> Result<Arc<dyn BrokerQueue>, BrokerError>;

    /// Counters for the named queues.
    fn collect_stats(&self, names: &[&str]) -> Result<HashMap<String, QueueStats>, BrokerError>;

    /// Stop consumption on every queue opened through this connection.
    fn stop_all_consuming(&self) -> StopHandle;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn ping(&self, timeout: Duration) -> Result<(), BrokerError> {
        (**self).ping(timeout)
    }

    fn open_queue(&self, name: &str) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
        (**self).open_queue(name)
    }

    fn collect_stats(&self, names: &[&str]) -> Result<HashMap<String, QueueStats>, BrokerError> {
        (**self).collect_stats(names)
    }

    fn stop_all_consuming(&self) -> StopHandle {
        (**self).stop_all_consuming()
    }
}
