//! Redis list-backed broker (durable, at-least-once delivery).
//!
//! ## Key layout
//!
//! - **Ready**: `rmq::queue::[<name>]::ready` (LPUSH on publish, RPOPLPUSH on fetch)
//! - **Unacked**: `rmq::connection::<conn>::queue::[<name>]::unacked`, one per
//!   broker connection. Entries left behind by a crashed process stay in that
//!   list; nothing here moves them back to ready
//! - **Rejected**: `rmq::queue::[<name>]::rejected`
//! - **Queue index**: `rmq::queues` (set of opened queue names)
//!
//! Ack is `LREM unacked 1 <payload>`; reject moves the payload from unacked to
//! rejected in one MULTI/EXEC pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, instrument};
use uuid::Uuid;

use super::{
    Broker, BrokerError, BrokerQueue, ConsumerGroup, Delivery, DeliveryConsumer, DeliverySource,
    QueueStats, StopHandle,
};

const QUEUES_KEY: &str = "rmq::queues";

fn ready_key(queue: &str) -> String {
    format!("rmq::queue::[{queue}]::ready")
}

fn rejected_key(queue: &str) -> String {
    format!("rmq::queue::[{queue}]::rejected")
}

fn unacked_key(connection: &str, queue: &str) -> String {
    format!("rmq::connection::{connection}::queue::[{queue}]::unacked")
}

fn connection_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Connection(e.to_string())
}

fn command_error(e: redis::RedisError) -> BrokerError {
    BrokerError::Command(e.to_string())
}

#[derive(Debug)]
pub struct RedisBroker {
    client: Arc<redis::Client>,
    connection_name: String,
    queues: RwLock<HashMap<String, Arc<RedisQueue>>>,
}

impl RedisBroker {
    /// Create a broker connection.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `tag` - connection tag; a random suffix makes the connection name unique
    pub fn new(redis_url: impl AsRef<str>, tag: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(connection_error)?;

        Ok(Self {
            client: Arc::new(client),
            connection_name: format!("{tag}-{}", Uuid::now_v7().simple()),
            queues: RwLock::new(HashMap::new()),
        })
    }

    /// Unique name of this connection; scopes the unacked lists.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }
}

impl Broker for RedisBroker {
    fn ping(&self, timeout: Duration) -> Result<(), BrokerError> {
        let mut conn = self
            .client
            .get_connection_with_timeout(timeout)
            .map_err(connection_error)?;
        conn.set_read_timeout(Some(timeout)).map_err(connection_error)?;
        conn.set_write_timeout(Some(timeout)).map_err(connection_error)?;
        let _: String = redis::cmd("PING").query(&mut conn).map_err(connection_error)?;
        Ok(())
    }

    fn open_queue(&self, name: &str) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
        let existing = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if let Some(queue) = existing {
            let queue: Arc<dyn BrokerQueue> = queue;
            return Ok(queue);
        }

        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let _: i64 = redis::cmd("SADD")
            .arg(QUEUES_KEY)
            .arg(name)
            .query(&mut conn)
            .map_err(command_error)?;

        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue: Arc<dyn BrokerQueue> = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(RedisQueue {
                    name: name.to_string(),
                    keys: Arc::new(QueueKeys::new(&self.connection_name, name)),
                    client: self.client.clone(),
                    group: Mutex::new(None),
                })
            })
            .clone();
        Ok(queue)
    }

    fn collect_stats(&self, names: &[&str]) -> Result<HashMap<String, QueueStats>, BrokerError> {
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);

        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let keys = QueueKeys::new(&self.connection_name, name);
            let (ready, unacked, rejected): (u64, u64, u64) = redis::pipe()
                .cmd("LLEN")
                .arg(&keys.ready)
                .cmd("LLEN")
                .arg(&keys.unacked)
                .cmd("LLEN")
                .arg(&keys.rejected)
                .query(&mut conn)
                .map_err(command_error)?;
            let consumers = queues.get(*name).map(|q| q.consumer_count()).unwrap_or(0);

            out.insert(
                name.to_string(),
                QueueStats {
                    ready,
                    unacked,
                    rejected,
                    consumers,
                },
            );
        }
        Ok(out)
    }

    fn stop_all_consuming(&self) -> StopHandle {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        StopHandle::all(queues.values().map(|q| q.stop_consuming()))
    }
}

#[derive(Debug)]
struct QueueKeys {
    ready: String,
    unacked: String,
    rejected: String,
}

impl QueueKeys {
    fn new(connection: &str, queue: &str) -> Self {
        Self {
            ready: ready_key(queue),
            unacked: unacked_key(connection, queue),
            rejected: rejected_key(queue),
        }
    }
}

pub struct RedisQueue {
    name: String,
    keys: Arc<QueueKeys>,
    client: Arc<redis::Client>,
    group: Mutex<Option<ConsumerGroup>>,
}

impl core::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    fn consumer_count(&self) -> usize {
        self.group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ConsumerGroup::worker_count)
            .unwrap_or(0)
    }
}

impl BrokerQueue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, payload), fields(queue = %self.name, bytes = payload.len()), err)]
    fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.keys.ready)
            .arg(payload)
            .query(&mut conn)
            .map_err(command_error)?;
        Ok(())
    }

    fn start_consuming(
        &self,
        prefetch_limit: usize,
        poll_interval: Duration,
    ) -> Result<(), BrokerError> {
        let mut group = self.group.lock().unwrap_or_else(PoisonError::into_inner);
        if group.as_ref().is_some_and(|g| !g.is_stopped()) {
            return Err(BrokerError::AlreadyConsuming(self.name.clone()));
        }
        let source = Arc::new(RedisFetcher {
            client: self.client.clone(),
            keys: self.keys.clone(),
        });
        *group = Some(ConsumerGroup::start(
            &self.name,
            source,
            prefetch_limit,
            poll_interval,
        )?);
        Ok(())
    }

    fn add_consumer(
        &self,
        tag: &str,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<String, BrokerError> {
        let group = self.group.lock().unwrap_or_else(PoisonError::into_inner);
        match group.as_ref() {
            Some(g) => g.add_worker(tag, consumer),
            None => Err(BrokerError::NotConsuming(self.name.clone())),
        }
    }

    fn stop_consuming(&self) -> StopHandle {
        let group = self.group.lock().unwrap_or_else(PoisonError::into_inner);
        match group.as_ref() {
            Some(g) => g.stop(),
            None => StopHandle::completed(),
        }
    }
}

struct RedisFetcher {
    client: Arc<redis::Client>,
    keys: Arc<QueueKeys>,
}

impl DeliverySource for RedisFetcher {
    fn fetch(&self) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let payload: Option<Vec<u8>> = redis::cmd("RPOPLPUSH")
            .arg(&self.keys.ready)
            .arg(&self.keys.unacked)
            .query(&mut conn)
            .map_err(command_error)?;

        Ok(payload.map(|payload| {
            Box::new(RedisDelivery {
                client: self.client.clone(),
                keys: self.keys.clone(),
                payload,
            }) as Box<dyn Delivery>
        }))
    }
}

struct RedisDelivery {
    client: Arc<redis::Client>,
    keys: Arc<QueueKeys>,
    payload: Vec<u8>,
}

impl Delivery for RedisDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        let removed: i64 = redis::cmd("LREM")
            .arg(&self.keys.unacked)
            .arg(1)
            .arg(&self.payload)
            .query(&mut conn)
            .map_err(command_error)?;
        if removed == 0 {
            debug!(unacked = %self.keys.unacked, "ack found no unacked entry");
        }
        Ok(())
    }

    fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        let mut conn = self.client.get_connection().map_err(connection_error)?;
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.keys.unacked)
            .arg(1)
            .arg(&self.payload)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.keys.rejected)
            .arg(&self.payload)
            .ignore()
            .query::<()>(&mut conn)
            .map_err(command_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(ready_key("email_queue"), "rmq::queue::[email_queue]::ready");
        assert_eq!(
            rejected_key("email_queue"),
            "rmq::queue::[email_queue]::rejected"
        );
        assert_eq!(
            unacked_key("courier-queue-abc", "email_queue"),
            "rmq::connection::courier-queue-abc::queue::[email_queue]::unacked"
        );
    }

    #[test]
    fn connection_names_are_unique_per_broker() {
        let a = RedisBroker::new("redis://127.0.0.1:6379", "courier-queue").unwrap();
        let b = RedisBroker::new("redis://127.0.0.1:6379", "courier-queue").unwrap();

        assert!(a.connection_name().starts_with("courier-queue-"));
        assert_ne!(a.connection_name(), b.connection_name());
    }

    #[test]
    fn ping_gives_up_on_a_silent_server() {
        use std::net::TcpListener;
        use std::sync::mpsc;
        use std::thread;
        use std::time::Instant;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            // Accept and hold connections without ever replying.
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });

        let broker = RedisBroker::new(format!("redis://{addr}"), "courier-queue").unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let start = Instant::now();
            let result = broker.ping(Duration::from_millis(300));
            let _ = tx.send((result, start.elapsed()));
        });

        let (result, elapsed) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("ping did not return");
        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        assert!(matches!(
            RedisBroker::new("not a url", "t"),
            Err(BrokerError::Connection(_))
        ));
    }
}
