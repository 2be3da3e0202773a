//! In-process broker for development and tests.
//!
//! Same ready → unacked → (acked | rejected) lifecycle as the Redis broker,
//! kept in memory. Nothing survives the process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::{
    Broker, BrokerError, BrokerQueue, ConsumerGroup, Delivery, DeliveryConsumer, DeliverySource,
    QueueStats, StopHandle,
};

/// In-memory broker.
///
/// `set_online(false)` simulates a lost connection: `ping` and `publish` fail
/// until it is switched back on.
#[derive(Debug)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, Arc<InMemoryQueue>>>,
    online: Arc<AtomicBool>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Inspect a queue opened on this broker.
    pub fn queue(&self, name: &str) -> Option<Arc<InMemoryQueue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Connection("in-memory broker is offline".to_string()))
        }
    }
}

impl Broker for InMemoryBroker {
    fn ping(&self, _timeout: Duration) -> Result<(), BrokerError> {
        self.ensure_online()
    }

    fn open_queue(&self, name: &str) -> Result<Arc<dyn BrokerQueue>, BrokerError> {
        self.ensure_online()?;
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue: Arc<dyn BrokerQueue> = queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryQueue::new(name, self.online.clone())))
            .clone();
        Ok(queue)
    }

    fn collect_stats(&self, names: &[&str]) -> Result<HashMap<String, QueueStats>, BrokerError> {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        Ok(names
            .iter()
            .map(|name| {
                let stats = queues.get(*name).map(|q| q.stats()).unwrap_or_default();
                (name.to_string(), stats)
            })
            .collect())
    }

    fn stop_all_consuming(&self) -> StopHandle {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        StopHandle::all(queues.values().map(|q| q.stop_consuming()))
    }
}

#[derive(Debug, Default)]
struct Lists {
    ready: VecDeque<Vec<u8>>,
    unacked: HashMap<u64, Vec<u8>>,
    rejected: Vec<Vec<u8>>,
    next_tag: u64,
    peak_unacked: usize,
    published: u64,
    acked: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    lists: Mutex<Lists>,
}

impl QueueState {
    fn lists(&self) -> std::sync::MutexGuard<'_, Lists> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fetch side of a queue. Deliveries hold the state by `Arc` so they can
/// settle after the fetch call returns.
struct Fetcher(Arc<QueueState>);

impl DeliverySource for Fetcher {
    fn fetch(&self) -> Result<Option<Box<dyn Delivery>>, BrokerError> {
        let mut lists = self.0.lists();
        let Some(payload) = lists.ready.pop_front() else {
            return Ok(None);
        };
        let tag = lists.next_tag;
        lists.next_tag += 1;
        lists.unacked.insert(tag, payload.clone());
        lists.peak_unacked = lists.peak_unacked.max(lists.unacked.len());

        Ok(Some(Box::new(InMemoryDelivery {
            state: self.0.clone(),
            tag,
            payload,
        })))
    }
}

struct InMemoryDelivery {
    state: Arc<QueueState>,
    tag: u64,
    payload: Vec<u8>,
}

impl Delivery for InMemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn ack(self: Box<Self>) -> Result<(), BrokerError> {
        let mut lists = self.state.lists();
        if lists.unacked.remove(&self.tag).is_some() {
            lists.acked += 1;
        }
        Ok(())
    }

    fn reject(self: Box<Self>) -> Result<(), BrokerError> {
        let mut lists = self.state.lists();
        if let Some(payload) = lists.unacked.remove(&self.tag) {
            lists.rejected.push(payload);
        }
        Ok(())
    }
}

/// One in-memory queue.
pub struct InMemoryQueue {
    name: String,
    state: Arc<QueueState>,
    online: Arc<AtomicBool>,
    group: Mutex<Option<ConsumerGroup>>,
}

impl core::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl InMemoryQueue {
    fn new(name: &str, online: Arc<AtomicBool>) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(QueueState::default()),
            online,
            group: Mutex::new(None),
        }
    }

    fn stats(&self) -> QueueStats {
        let consumers = self.consumer_count();
        let lists = self.state.lists();
        QueueStats {
            ready: lists.ready.len() as u64,
            unacked: lists.unacked.len() as u64,
            rejected: lists.rejected.len() as u64,
            consumers,
        }
    }

    fn consumer_count(&self) -> usize {
        self.group
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ConsumerGroup::worker_count)
            .unwrap_or(0)
    }

    /// Highest number of simultaneously unacked deliveries seen so far.
    pub fn peak_unacked(&self) -> usize {
        self.state.lists().peak_unacked
    }

    /// Total messages ever published to this queue.
    pub fn published_count(&self) -> u64 {
        self.state.lists().published
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lists().acked
    }

    pub fn ready_count(&self) -> usize {
        self.state.lists().ready.len()
    }

    pub fn unacked_count(&self) -> usize {
        self.state.lists().unacked.len()
    }

    /// Payloads in the rejected list, oldest first.
    pub fn rejected(&self) -> Vec<Vec<u8>> {
        self.state.lists().rejected.clone()
    }
}

impl BrokerQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("in-memory broker is offline".to_string()));
        }
        let mut lists = self.state.lists();
        lists.ready.push_back(payload.to_vec());
        lists.published += 1;
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
        *group = Some(ConsumerGroup::start(
            &self.name,
            Arc::new(Fetcher(self.state.clone())),
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
