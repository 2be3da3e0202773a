//! Prefetch-bounded consumer group shared by the broker implementations.
//!
//! One fetcher thread moves ready messages into a channel while fewer than
//! `prefetch_limit` deliveries are in flight; consumer workers drain the
//! channel. A delivery stays in flight until it is acked, rejected or dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{BrokerError, Delivery, DeliveryConsumer};

/// Where a consumer group pulls deliveries from.
pub(crate) trait DeliverySource: Send + Sync + 'static {
    /// Move one ready message to the unacked set. `None` when the queue is empty.
    fn fetch(&self) -> Result<Option<Box<dyn Delivery>>, BrokerError>;
}

/// Completion handle for a stop request.
///
/// Cloneable; waiting does not consume it.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    latches: Vec<Arc<Latch>>,
}

impl StopHandle {
    /// A handle that is already complete.
    pub fn completed() -> Self {
        Self::default()
    }

    /// Completes once every handle in `handles` has completed.
    pub fn all(handles: impl IntoIterator<Item = StopHandle>) -> Self {
        Self {
            latches: handles.into_iter().flat_map(|h| h.latches).collect(),
        }
    }

    fn pending() -> (Self, Arc<Latch>) {
        let latch = Arc::new(Latch::default());
        (
            Self {
                latches: vec![latch.clone()],
            },
            latch,
        )
    }

    pub fn is_done(&self) -> bool {
        self.latches.iter().all(|l| l.is_set())
    }

    /// Block until complete or `timeout` elapses. Returns `true` when complete.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.latches.iter().all(|l| l.wait_until(deadline))
    }
}

#[derive(Debug, Default)]
struct Latch {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn set(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cv.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until(&self, deadline: Instant) -> bool {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = self
                .cv
                .wait_timeout(done, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Count of fetched-but-unsettled deliveries.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    changed: Condvar,
}

impl InFlight {
    fn acquire(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        self.changed.notify_all();
    }

    fn current(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for the count to drop below `limit`.
    fn wait_below(&self, limit: usize, timeout: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, _) = self
            .changed
            .wait_timeout_while(count, timeout, |c| *c >= limit)
            .unwrap_or_else(PoisonError::into_inner);
        *count < limit
    }
}

/// Delivery wrapper that releases its in-flight slot when settled or dropped.
struct TrackedDelivery {
    inner: Option<Box<dyn Delivery>>,
    in_flight: Arc<InFlight>,
}

impl Delivery for TrackedDelivery {
    fn payload(&self) -> &[u8] {
        self.inner.as_ref().map(|d| d.payload()).unwrap_or_default()
    }

    fn ack(mut self: Box<Self>) -> Result<(), BrokerError> {
        match self.inner.take() {
            Some(d) => d.ack(),
            None => Ok(()),
        }
    }

    fn reject(mut self: Box<Self>) -> Result<(), BrokerError> {
        match self.inner.take() {
            Some(d) => d.reject(),
            None => Ok(()),
        }
    }
}

impl Drop for TrackedDelivery {
    fn drop(&mut self) {
        self.in_flight.release();
    }
}

type DeliveryRx = Arc<Mutex<Receiver<Box<dyn Delivery>>>>;

struct Threads {
    fetcher: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    stop: Option<StopHandle>,
}

/// A running fetcher plus its consumer workers for one queue.
pub(crate) struct ConsumerGroup {
    queue: String,
    poll_interval: Duration,
    stopping: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
    rx: DeliveryRx,
    threads: Mutex<Threads>,
}

impl ConsumerGroup {
    /// Spawn the fetcher. Workers are attached with [`ConsumerGroup::add_worker`].
    pub(crate) fn start(
        queue: &str,
        source: Arc<dyn DeliverySource>,
        prefetch_limit: usize,
        poll_interval: Duration,
    ) -> Result<Self, BrokerError> {
        if prefetch_limit == 0 {
            return Err(BrokerError::InvalidOption(
                "prefetch limit must be at least 1".to_string(),
            ));
        }
        if poll_interval.is_zero() {
            return Err(BrokerError::InvalidOption(
                "poll interval must be non-zero".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel::<Box<dyn Delivery>>();
        let stopping = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(InFlight::default());

        let fetcher = {
            let queue = queue.to_string();
            let stopping = stopping.clone();
            let in_flight = in_flight.clone();
            thread::Builder::new()
                .name(format!("{queue}-fetcher"))
                .spawn(move || {
                    fetch_loop(
                        &queue,
                        source,
                        tx,
                        &stopping,
                        in_flight,
                        prefetch_limit,
                        poll_interval,
                    )
                })
                .map_err(|e| BrokerError::Spawn(e.to_string()))?
        };

        info!(
            queue = %queue,
            prefetch_limit,
            poll_interval_ms = poll_interval.as_millis() as u64,
            "consumption started"
        );

        Ok(Self {
            queue: queue.to_string(),
            poll_interval,
            stopping,
            in_flight,
            rx: Arc::new(Mutex::new(rx)),
            threads: Mutex::new(Threads {
                fetcher: Some(fetcher),
                workers: Vec::new(),
                stop: None,
            }),
        })
    }

    /// Attach one worker thread named `tag`.
    pub(crate) fn add_worker(
        &self,
        tag: &str,
        consumer: Arc<dyn DeliveryConsumer>,
    ) -> Result<String, BrokerError> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if threads.stop.is_some() {
            return Err(BrokerError::NotConsuming(self.queue.clone()));
        }

        let rx = self.rx.clone();
        let poll = self.poll_interval;
        let name = tag.to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let name = name.clone();
                move || worker_loop(&name, rx, consumer, poll)
            })
            .map_err(|e| BrokerError::Spawn(e.to_string()))?;
        threads.workers.push(handle);

        debug!(queue = %self.queue, consumer = %name, "consumer added");
        Ok(name)
    }

    /// Stop fetching. Idempotent; every call returns a handle to the same stop.
    pub(crate) fn stop(&self) -> StopHandle {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stop) = &threads.stop {
            return stop.clone();
        }

        self.stopping.store(true, Ordering::SeqCst);
        let (handle, latch) = StopHandle::pending();
        let fetcher = threads.fetcher.take();
        let workers = std::mem::take(&mut threads.workers);
        let queue = self.queue.clone();

        // Fetcher exits within one poll interval and drops the sender; workers
        // then drain what was already fetched and see the channel disconnect.
        let spawned = thread::Builder::new()
            .name(format!("{queue}-stopper"))
            .spawn({
                let latch = latch.clone();
                move || {
                    if let Some(f) = fetcher {
                        let _ = f.join();
                    }
                    for w in workers {
                        let _ = w.join();
                    }
                    debug!(queue = %queue, "consumers stopped");
                    latch.set();
                }
            });
        if let Err(e) = spawned {
            warn!(queue = %self.queue, error = %e, "failed to spawn stop thread; stop not awaited");
            latch.set();
        }

        threads.stop = Some(handle.clone());
        handle
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop
            .is_some()
    }

    /// Attached workers; zero once stopped.
    pub(crate) fn worker_count(&self) -> usize {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
            .len()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.current()
    }
}

impl Drop for ConsumerGroup {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
    }
}

fn fetch_loop(
    queue: &str,
    source: Arc<dyn DeliverySource>,
    tx: Sender<Box<dyn Delivery>>,
    stopping: &AtomicBool,
    in_flight: Arc<InFlight>,
    prefetch_limit: usize,
    poll_interval: Duration,
) {
    while !stopping.load(Ordering::SeqCst) {
        if !in_flight.wait_below(prefetch_limit, poll_interval) {
            continue;
        }

        match source.fetch() {
            Ok(Some(delivery)) => {
                in_flight.acquire();
                let tracked = TrackedDelivery {
                    inner: Some(delivery),
                    in_flight: in_flight.clone(),
                };
                if tx.send(Box::new(tracked)).is_err() {
                    break;
                }
            }
            Ok(None) => thread::sleep(poll_interval),
            Err(e) => {
                warn!(queue = %queue, error = %e, "fetch failed");
                thread::sleep(poll_interval);
            }
        }
    }
}

fn worker_loop(
    name: &str,
    rx: DeliveryRx,
    consumer: Arc<dyn DeliveryConsumer>,
    poll_interval: Duration,
) {
    loop {
        let next = {
            let rx = rx.lock().unwrap_or_else(PoisonError::into_inner);
            rx.recv_timeout(poll_interval)
        };
        match next {
            Ok(delivery) => consumer.consume(delivery),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(consumer = %name, "consumer exited");
}
