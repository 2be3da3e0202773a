//! Delivery adapter: decode, invoke the handler, then ack, retry or reject.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use courier_core::QueueConfig;

use crate::broker::{Delivery, DeliveryConsumer};
use crate::envelope::Envelope;
use crate::handler::{Handler, HandlerError, HandlerResult};
use crate::retry::RetryScheduler;

/// Consumer counters, cumulative since registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    /// Deliveries taken off the broker.
    pub processed: u64,
    /// Handler succeeded; delivery acknowledged.
    pub acked: u64,
    /// Handler failed; retry scheduled and delivery acknowledged.
    pub retried: u64,
    /// Handler failed terminally (or the retry could not be scheduled).
    pub rejected: u64,
    /// Payload was not a valid envelope.
    pub malformed: u64,
    /// Handler panics caught (also counted as retried or rejected).
    pub panicked: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    malformed: AtomicU64,
    panicked: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            processed: self.processed.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Broker consumer for one queue. Shared by all of the queue's workers.
pub struct Consumer {
    queue: String,
    handler: Arc<dyn Handler>,
    retry_limit: u32,
    retry_delay: Duration,
    retries: Arc<RetryScheduler>,
    report_batch_size: u64,
    counters: Counters,
}

impl core::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("retry_limit", &self.retry_limit)
            .field("retry_delay", &self.retry_delay)
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Retries are republished to `config.logical_name`.
    pub fn new(
        config: &QueueConfig,
        handler: Arc<dyn Handler>,
        retries: Arc<RetryScheduler>,
        report_batch_size: usize,
    ) -> Self {
        Self {
            queue: config.logical_name.clone(),
            handler,
            retry_limit: config.retry_limit,
            retry_delay: config.retry_delay,
            retries,
            report_batch_size: report_batch_size.max(1) as u64,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Run one delivery through decode → handle → settle.
    pub fn process(&self, delivery: Box<dyn Delivery>) {
        bump(&self.counters.processed);

        match Envelope::decode(delivery.payload()) {
            Ok(envelope) => self.dispatch(envelope, delivery),
            Err(e) => {
                error!(queue = %self.queue, error = %e, "malformed message; rejecting");
                bump(&self.counters.malformed);
                self.reject(delivery);
            }
        }

        self.maybe_report();
    }

    fn dispatch(&self, mut envelope: Envelope, delivery: Box<dyn Delivery>) {
        let message_id = envelope.id();

        let err = match self.invoke(&envelope) {
            Ok(()) => {
                debug!(queue = %self.queue, message_id = %message_id, "message processed");
                if self.ack(delivery) {
                    bump(&self.counters.acked);
                }
                return;
            }
            Err(err) => err,
        };

        if matches!(err, HandlerError::Panicked(_)) {
            bump(&self.counters.panicked);
        }

        if envelope.retry_count() >= self.retry_limit {
            error!(
                queue = %self.queue,
                message_id = %message_id,
                retry_count = envelope.retry_count(),
                retry_limit = self.retry_limit,
                error = %err,
                "retry limit reached; rejecting"
            );
            bump(&self.counters.rejected);
            self.reject(delivery);
            return;
        }

        let retry_count = envelope.record_retry();
        match self.retries.schedule(&self.queue, envelope, self.retry_delay) {
            Ok(()) => {
                warn!(
                    queue = %self.queue,
                    message_id = %message_id,
                    retry_count,
                    retry_limit = self.retry_limit,
                    retry_delay_ms = self.retry_delay.as_millis() as u64,
                    error = %err,
                    "handler failed; retry scheduled"
                );
                if self.ack(delivery) {
                    bump(&self.counters.retried);
                }
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    message_id = %message_id,
                    retry_count,
                    error = %e,
                    "failed to schedule retry; rejecting"
                );
                bump(&self.counters.rejected);
                self.reject(delivery);
            }
        }
    }

    /// Handler call with panics converted to [`HandlerError::Panicked`].
    fn invoke(&self, envelope: &Envelope) -> HandlerResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(envelope))) {
            Ok(result) => result,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(
                    queue = %self.queue,
                    message_id = %envelope.id(),
                    panic = %msg,
                    "handler panicked"
                );
                Err(HandlerError::Panicked(msg))
            }
        }
    }

    fn ack(&self, delivery: Box<dyn Delivery>) -> bool {
        match delivery.ack() {
            Ok(()) => true,
            Err(e) => {
                error!(queue = %self.queue, error = %e, "ack failed; message stays unacked");
                false
            }
        }
    }

    fn reject(&self, delivery: Box<dyn Delivery>) {
        if let Err(e) = delivery.reject() {
            error!(queue = %self.queue, error = %e, "reject failed; message stays unacked");
        }
    }

    fn maybe_report(&self) {
        let stats = self.counters.snapshot();
        if stats.processed % self.report_batch_size == 0 {
            info!(
                queue = %self.queue,
                processed = stats.processed,
                acked = stats.acked,
                retried = stats.retried,
                rejected = stats.rejected,
                malformed = stats.malformed,
                panicked = stats.panicked,
                "consumer summary"
            );
        }
    }
}

impl DeliveryConsumer for Consumer {
    fn consume(&self, delivery: Box<dyn Delivery>) {
        self.process(delivery);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
