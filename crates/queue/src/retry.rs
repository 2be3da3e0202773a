//! Delayed republish of failed envelopes.
//!
//! A single timer thread owns a min-heap of due times. Entries are keyed by
//! envelope id, so a pending retry can be listed, cancelled or flushed at
//! shutdown. Heap entries made stale by cancel or re-schedule are skipped when
//! they surface.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::broker::BrokerError;
use crate::envelope::{Envelope, EnvelopeId};
use crate::error::{QueueError, QueueResult};

/// Target of fired retries; implemented by the queue manager.
pub trait Republish: Send + Sync {
    fn republish(&self, queue: &str, envelope: Envelope) -> QueueResult<()>;
}

/// A retry waiting for its due time.
#[derive(Debug, Clone)]
pub struct PendingRetry {
    pub queue: String,
    pub envelope: Envelope,
    pub due: Instant,
}

struct Entry {
    seq: u64,
    retry: PendingRetry,
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Reverse<(Instant, u64, EnvelopeId)>>,
    pending: HashMap<EnvelopeId, Entry>,
    next_seq: u64,
    closed: bool,
    timer: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    target: Weak<dyn Republish>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Timer-driven retry scheduler.
///
/// Holds only a weak reference to its [`Republish`] target: a retry that fires
/// after the target is gone is logged and dropped.
pub struct RetryScheduler {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for RetryScheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("RetryScheduler")
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl RetryScheduler {
    /// The timer thread is spawned on first `schedule`.
    pub fn new(target: Weak<dyn Republish>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
                target,
            }),
        }
    }

    /// Republish `envelope` to `queue` after `delay`.
    ///
    /// Scheduling an id that is already pending replaces the earlier entry.
    pub fn schedule(&self, queue: &str, envelope: Envelope, delay: Duration) -> QueueResult<()> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.timer.is_none() {
            let shared = self.shared.clone();
            let timer = thread::Builder::new()
                .name("retry-scheduler".to_string())
                .spawn(move || timer_loop(&shared))
                .map_err(|e| BrokerError::Spawn(e.to_string()))?;
            state.timer = Some(timer);
        }

        let id = envelope.id();
        let due = Instant::now() + delay;
        let seq = state.next_seq;
        state.next_seq += 1;

        let entry = Entry {
            seq,
            retry: PendingRetry {
                queue: queue.to_string(),
                envelope,
                due,
            },
        };
        if state.pending.insert(id, entry).is_some() {
            warn!(queue = %queue, message_id = %id, "retry already pending; replaced");
        }
        state.heap.push(Reverse((due, seq, id)));
        drop(state);

        self.shared.wake.notify_all();
        Ok(())
    }

    /// Remove a pending retry. Returns it if it had not fired yet.
    pub fn cancel(&self, id: &EnvelopeId) -> Option<PendingRetry> {
        let removed = self.shared.lock().pending.remove(id).map(|e| e.retry);
        if removed.is_some() {
            self.shared.wake.notify_all();
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Snapshot of pending retries, earliest due first.
    pub fn pending(&self) -> Vec<PendingRetry> {
        let state = self.shared.lock();
        sorted(state.pending.values().map(|e| e.retry.clone()).collect())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Stop the timer and hand back every retry that has not fired, earliest
    /// due first. Later `schedule` calls fail with [`QueueError::Closed`].
    pub fn shutdown(&self) -> Vec<PendingRetry> {
        let (drained, timer) = {
            let mut state = self.shared.lock();
            state.closed = true;
            state.heap.clear();
            let drained: Vec<PendingRetry> = state.pending.drain().map(|(_, e)| e.retry).collect();
            (drained, state.timer.take())
        };
        self.shared.wake.notify_all();

        if let Some(timer) = timer {
            if timer.join().is_err() {
                error!("retry scheduler thread panicked");
            }
        }
        sorted(drained)
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.wake.notify_all();
    }
}

fn sorted(mut retries: Vec<PendingRetry>) -> Vec<PendingRetry> {
    retries.sort_by_key(|r| r.due);
    retries
}

fn timer_loop(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.closed {
            break;
        }

        let next = state.heap.peek().map(|Reverse(key)| *key);
        let Some((due, seq, id)) = next else {
            state = shared.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            continue;
        };

        let now = Instant::now();
        if due > now {
            state = shared
                .wake
                .wait_timeout(state, due - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            continue;
        }

        state.heap.pop();
        let live = state.pending.get(&id).is_some_and(|e| e.seq == seq);
        if !live {
            continue;
        }
        let Some(entry) = state.pending.remove(&id) else {
            continue;
        };

        drop(state);
        fire(&shared.target, entry.retry);
        state = shared.lock();
    }
    debug!("retry scheduler stopped");
}

fn fire(target: &Weak<dyn Republish>, retry: PendingRetry) {
    let id = retry.envelope.id();
    let retry_count = retry.envelope.retry_count();

    let Some(target) = target.upgrade() else {
        error!(
            queue = %retry.queue,
            message_id = %id,
            retry_count,
            "queue manager gone; retry dropped"
        );
        return;
    };

    match target.republish(&retry.queue, retry.envelope) {
        Ok(()) => debug!(queue = %retry.queue, message_id = %id, retry_count, "retry republished"),
        Err(e) => error!(
            queue = %retry.queue,
            message_id = %id,
            retry_count,
            error = %e,
            "failed to republish retry"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<(String, EnvelopeId, Instant)>>,
    }

    impl Republish for Recorder {
        fn republish(&self, queue: &str, envelope: Envelope) -> QueueResult<()> {
            self.fired
                .lock()
                .unwrap()
                .push((queue.to_string(), envelope.id(), Instant::now()));
            Ok(())
        }
    }

    fn scheduler() -> (Arc<Recorder>, RetryScheduler) {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Republish> = Arc::downgrade(&recorder) as Weak<dyn Republish>;
        (recorder, RetryScheduler::new(weak))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn fires_in_due_order_after_delay() {
        let (recorder, retries) = scheduler();
        let start = Instant::now();
        let late = Envelope::new("job", b"late".to_vec());
        let early = Envelope::new("job", b"early".to_vec());
        let (late_id, early_id) = (late.id(), early.id());

        retries.schedule("q", late, Duration::from_millis(80)).unwrap();
        retries.schedule("q", early, Duration::from_millis(20)).unwrap();
        assert_eq!(retries.pending_count(), 2);
        assert_eq!(retries.pending()[0].envelope.id(), early_id);

        assert!(wait_for(|| recorder.fired.lock().unwrap().len() == 2));
        let fired = recorder.fired.lock().unwrap().clone();
        assert_eq!(fired[0].1, early_id);
        assert_eq!(fired[1].1, late_id);
        assert!(fired[0].2 - start >= Duration::from_millis(20));
        assert!(fired[1].2 - start >= Duration::from_millis(80));
        assert_eq!(retries.pending_count(), 0);
    }

    #[test]
    fn retries_due_together_all_fire() {
        let (recorder, retries) = scheduler();
        let ids: Vec<EnvelopeId> = (0..8)
            .map(|_| {
                let envelope = Envelope::new("job", Vec::new());
                let id = envelope.id();
                retries.schedule("q", envelope, Duration::ZERO).unwrap();
                id
            })
            .collect();

        assert!(wait_for(|| recorder.fired.lock().unwrap().len() == ids.len()));
        let mut fired: Vec<EnvelopeId> =
            recorder.fired.lock().unwrap().iter().map(|f| f.1).collect();
        fired.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(fired, expected);
        assert_eq!(retries.pending_count(), 0);
    }

    #[test]
    fn cancelled_retry_never_fires() {
        let (recorder, retries) = scheduler();
        let envelope = Envelope::new("job", Vec::new());
        let id = envelope.id();

        retries.schedule("q", envelope, Duration::from_millis(30)).unwrap();
        let cancelled = retries.cancel(&id).unwrap();
        assert_eq!(cancelled.queue, "q");
        assert!(retries.cancel(&id).is_none());

        thread::sleep(Duration::from_millis(80));
        assert!(recorder.fired.lock().unwrap().is_empty());
    }

    #[test]
    fn rescheduling_the_same_id_replaces_the_entry() {
        let (recorder, retries) = scheduler();
        let envelope = Envelope::new("job", Vec::new());

        retries.schedule("q", envelope.clone(), Duration::from_millis(10)).unwrap();
        retries.schedule("other", envelope, Duration::from_millis(40)).unwrap();
        assert_eq!(retries.pending_count(), 1);

        assert!(wait_for(|| !recorder.fired.lock().unwrap().is_empty()));
        thread::sleep(Duration::from_millis(30));
        let fired = recorder.fired.lock().unwrap().clone();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "other");
    }

    #[test]
    fn shutdown_drains_pending_and_closes() {
        let (recorder, retries) = scheduler();
        retries
            .schedule("q", Envelope::new("job", Vec::new()), Duration::from_secs(60))
            .unwrap();
        retries
            .schedule("q", Envelope::new("job", Vec::new()), Duration::from_secs(30))
            .unwrap();

        let drained = retries.shutdown();
        assert_eq!(drained.len(), 2);
        assert!(drained[0].due <= drained[1].due);
        assert!(retries.is_closed());
        assert_eq!(retries.pending_count(), 0);
        assert!(recorder.fired.lock().unwrap().is_empty());

        assert!(matches!(
            retries.schedule("q", Envelope::new("job", Vec::new()), Duration::ZERO),
            Err(QueueError::Closed)
        ));
    }

    #[test]
    fn dropped_target_drops_the_retry() {
        let (recorder, retries) = scheduler();
        drop(recorder);

        retries
            .schedule("q", Envelope::new("job", Vec::new()), Duration::from_millis(5))
            .unwrap();
        assert!(wait_for(|| retries.pending_count() == 0));
    }
}
