//! Queue manager: owns the broker connection, the handler registry, publishing
//! and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use courier_core::{QueueConfig, QueueSettings};

use crate::broker::{Broker, BrokerQueue, QueueStats};
use crate::consumer::{Consumer, ConsumerStats};
use crate::envelope::{Envelope, EnvelopeId};
use crate::error::{QueueError, QueueResult};
use crate::handler::Handler;
use crate::retry::{PendingRetry, Republish, RetryScheduler};

/// Bound on the startup connectivity check.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

struct RegisteredQueue {
    config: QueueConfig,
    queue: Arc<dyn BrokerQueue>,
    handler: Arc<dyn Handler>,
    consumer: Arc<Consumer>,
    consumers: Vec<String>,
}

/// Broker-backed queue manager.
///
/// Construct once with [`QueueManager::open`] and share the returned `Arc`.
/// `close` is irreversible: afterwards every operation returns
/// [`QueueError::Closed`].
pub struct QueueManager {
    broker: Arc<dyn Broker>,
    settings: QueueSettings,
    queues: RwLock<HashMap<String, RegisteredQueue>>,
    retries: Arc<RetryScheduler>,
    closed: AtomicBool,
}

impl core::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueManager")
            .field("tag", &self.settings.connection.tag)
            .field("queues", &self.registered_queues())
            .field("retries", &self.retries)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Validate `settings` and verify the broker answers a ping.
    pub fn open(settings: QueueSettings, broker: Arc<dyn Broker>) -> QueueResult<Arc<Self>> {
        settings.validate()?;
        broker.ping(PING_TIMEOUT).map_err(QueueError::Connectivity)?;

        info!(
            tag = %settings.connection.tag,
            queues = settings.queues.len(),
            "queue manager connected"
        );

        Ok(Arc::new_cyclic(|me: &Weak<Self>| {
            let target: Weak<dyn Republish> = me.clone();
            Self {
                broker,
                settings,
                queues: RwLock::new(HashMap::new()),
                retries: Arc::new(RetryScheduler::new(target)),
                closed: AtomicBool::new(false),
            }
        }))
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Bind `handler` to its queue and start consuming.
    ///
    /// Opens the configured broker queue, starts consumption with the
    /// configured prefetch limit and poll interval, and attaches
    /// `handler.num_consumers()` workers named `<queue>-consumer-<i>`.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> QueueResult<()> {
        self.ensure_open()?;
        let name = handler.queue_name().to_string();

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        // `close` may have snapshotted the registry while we waited for the lock.
        self.ensure_open()?;
        if queues.contains_key(&name) {
            return Err(QueueError::AlreadyRegistered(name));
        }
        let config = self
            .settings
            .queue_config(&name)
            .ok_or_else(|| QueueError::UnknownConfig(name.clone()))?;

        let worker_count = handler.num_consumers();
        if worker_count == 0 {
            return Err(QueueError::InvalidHandler {
                queue: name,
                reason: "num_consumers must be at least 1".to_string(),
            });
        }

        let queue = self.broker.open_queue(&config.broker_name)?;
        queue.start_consuming(config.prefetch_limit, config.poll_interval)?;

        let consumer = Arc::new(Consumer::new(
            &config,
            handler.clone(),
            self.retries.clone(),
            self.settings.connection.report_batch_size,
        ));

        let mut consumers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            match queue.add_consumer(&format!("{name}-consumer-{i}"), consumer.clone()) {
                Ok(tag) => consumers.push(tag),
                Err(e) => {
                    queue.stop_consuming();
                    return Err(e.into());
                }
            }
        }

        info!(
            queue = %name,
            broker_queue = %config.broker_name,
            consumers = worker_count,
            prefetch_limit = config.prefetch_limit,
            retry_limit = config.retry_limit,
            "handler registered"
        );

        queues.insert(
            name,
            RegisteredQueue {
                config,
                queue,
                handler,
                consumer,
                consumers,
            },
        );
        Ok(())
    }

    /// Enqueue `envelope` on a registered queue. Does not wait for consumption.
    pub fn publish(&self, queue: &str, envelope: &Envelope) -> QueueResult<()> {
        self.ensure_open()?;
        self.publish_inner(queue, envelope)
    }

    /// Wrap `value` in a fresh envelope of type `kind` and publish it.
    pub fn publish_payload<T>(&self, queue: &str, kind: &str, value: &T) -> QueueResult<EnvelopeId>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::from_value(kind, value)?;
        self.publish(queue, &envelope)?;
        Ok(envelope.id())
    }

    #[instrument(skip(self, envelope), fields(message_id = %envelope.id(), message_type = %envelope.kind()), err)]
    fn publish_inner(&self, queue: &str, envelope: &Envelope) -> QueueResult<()> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let registered = queues
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;

        let bytes = envelope.encode()?;
        registered.queue.publish(&bytes)?;

        debug!(
            broker_queue = %registered.config.broker_name,
            retry_count = envelope.retry_count(),
            "message published"
        );
        Ok(())
    }

    /// Broker counters for a registered queue.
    pub fn stats(&self, queue: &str) -> QueueResult<QueueStats> {
        self.ensure_open()?;
        let broker_name = {
            let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
            queues
                .get(queue)
                .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?
                .queue
                .name()
                .to_string()
        };

        let mut stats = self.broker.collect_stats(&[broker_name.as_str()])?;
        Ok(stats.remove(&broker_name).unwrap_or_default())
    }

    /// Consumer counters for a registered queue.
    pub fn consumer_stats(&self, queue: &str) -> QueueResult<ConsumerStats> {
        self.ensure_open()?;
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues
            .get(queue)
            .map(|r| r.consumer.stats())
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    /// Worker names attached to a registered queue.
    pub fn consumer_names(&self, queue: &str) -> QueueResult<Vec<String>> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues
            .get(queue)
            .map(|r| r.consumers.clone())
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))
    }

    /// The handler bound to a registered queue.
    pub fn handler(&self, queue: &str) -> Option<Arc<dyn Handler>> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        queues.get(queue).map(|r| r.handler.clone())
    }

    /// Logical names of registered queues, sorted.
    pub fn registered_queues(&self) -> Vec<String> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Retries waiting for their delay, earliest due first.
    pub fn pending_retries(&self) -> Vec<PendingRetry> {
        self.retries.pending()
    }

    /// Stop consuming and release the broker.
    ///
    /// 1. Stop each queue, waiting up to `drain_timeout` for in-flight work
    /// 2. Stop all consuming on the broker, waiting up to `shutdown_timeout`
    /// 3. Republish pending retries immediately, then clear the registry
    ///
    /// Timeouts are logged and shutdown proceeds.
    pub fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        let conn = &self.settings.connection;
        info!(tag = %conn.tag, "closing queue manager");

        let opened: Vec<(String, Arc<dyn BrokerQueue>)> = {
            let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
            queues
                .iter()
                .map(|(name, r)| (name.clone(), r.queue.clone()))
                .collect()
        };

        for (name, queue) in &opened {
            if !queue.stop_consuming().wait_timeout(conn.drain_timeout) {
                warn!(
                    queue = %name,
                    timeout_ms = conn.drain_timeout.as_millis() as u64,
                    "timed out waiting for queue to drain"
                );
            }
        }

        if !self
            .broker
            .stop_all_consuming()
            .wait_timeout(conn.shutdown_timeout)
        {
            warn!(
                timeout_ms = conn.shutdown_timeout.as_millis() as u64,
                "timed out waiting for consumers to stop"
            );
        }

        let flushed = self.retries.shutdown();
        if !flushed.is_empty() {
            info!(count = flushed.len(), "republishing pending retries");
        }
        for retry in flushed {
            if let Err(e) = self.publish_inner(&retry.queue, &retry.envelope) {
                error!(
                    queue = %retry.queue,
                    message_id = %retry.envelope.id(),
                    retry_count = retry.envelope.retry_count(),
                    error = %e,
                    "failed to flush pending retry"
                );
            }
        }

        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!(tag = %conn.tag, "queue manager closed");
        Ok(())
    }
}

impl Republish for QueueManager {
    fn republish(&self, queue: &str, envelope: Envelope) -> QueueResult<()> {
        self.publish_inner(queue, &envelope)
    }
}
