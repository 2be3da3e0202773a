//! End-to-end pipeline tests against the in-memory broker.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use courier_core::{QueueItemSettings, QueueSettings};
use courier_queue::{
    EMAIL_QUEUE, Envelope, FnHandler, Handler, HandlerError, InMemoryBroker, LogMailer,
    QueueBinding, QueueError, QueueManager, SEND_EMAIL, register_queue_handlers,
};

const JOBS: &str = "jobs";
const JOBS_BROKER: &str = "jobs_queue";

fn settings(retry_limit: u32, retry_delay: Duration, prefetch: usize) -> QueueSettings {
    let mut settings = QueueSettings::default();
    let conn = &mut settings.connection;
    conn.poll_duration = Duration::from_millis(5);
    conn.retry_limit = retry_limit;
    conn.retry_delay = retry_delay;
    conn.drain_timeout = Duration::from_secs(2);
    conn.shutdown_timeout = Duration::from_secs(2);
    conn.report_batch_size = 10;

    settings.queues.insert(
        JOBS.to_string(),
        QueueItemSettings {
            name: JOBS_BROKER.to_string(),
            num_consumers: Some(2),
            prefetch_limit: Some(prefetch),
        },
    );
    settings
}

fn start(settings: QueueSettings) -> (Arc<InMemoryBroker>, Arc<QueueManager>) {
    let broker = Arc::new(InMemoryBroker::new());
    let manager = QueueManager::open(settings, broker.clone()).unwrap();
    (broker, manager)
}

fn binding(consumers: usize, prefetch: usize) -> QueueBinding {
    QueueBinding::new(JOBS, consumers, prefetch)
}

/// Poll `cond` until it holds or `timeout` elapses.
fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn always_failing_handler_is_retried_to_the_limit_then_rejected() {
    let delay = Duration::from_millis(30);
    let (broker, manager) = start(settings(3, delay, 10));

    let seen = Arc::new(Mutex::new(Vec::<(u32, Instant)>::new()));
    let handler = FnHandler::new(binding(2, 10), {
        let seen = seen.clone();
        move |env: &Envelope| {
            seen.lock().unwrap().push((env.retry_count(), Instant::now()));
            Err(HandlerError::failed("always fails"))
        }
    });
    manager.register_handler(Arc::new(handler)).unwrap();

    let id = manager.publish_payload(JOBS, "job", &"payload").unwrap();
    let queue = broker.queue(JOBS_BROKER).unwrap();

    assert!(eventually(Duration::from_secs(5), || queue.rejected().len() == 1));
    // Give a stray redelivery the chance to show up.
    thread::sleep(delay * 3);

    let seen = seen.lock().unwrap().clone();
    let counts: Vec<u32> = seen.iter().map(|(c, _)| *c).collect();
    assert_eq!(counts, vec![0, 1, 2, 3]);
    assert!(seen[3].1 - seen[0].1 >= delay * 3);

    let rejected = Envelope::decode(&queue.rejected()[0]).unwrap();
    assert_eq!(rejected.id(), id);
    assert_eq!(rejected.retry_count(), 3);

    let stats = manager.stats(JOBS).unwrap();
    assert_eq!((stats.ready, stats.unacked, stats.rejected), (0, 0, 1));
    assert!(manager.pending_retries().is_empty());
    manager.close().unwrap();
}

#[test]
fn handler_that_recovers_is_acknowledged() {
    let (broker, manager) = start(settings(3, Duration::from_millis(10), 10));

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = FnHandler::new(binding(1, 10), {
        let calls = calls.clone();
        move |env: &Envelope| {
            calls.fetch_add(1, Ordering::SeqCst);
            if env.retry_count() < 2 {
                Err(HandlerError::failed("transient"))
            } else {
                Ok(())
            }
        }
    });
    manager.register_handler(Arc::new(handler)).unwrap();
    manager.publish_payload(JOBS, "job", &42).unwrap();

    assert!(eventually(Duration::from_secs(5), || {
        manager.consumer_stats(JOBS).unwrap().acked == 1
    }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let queue = broker.queue(JOBS_BROKER).unwrap();
    assert!(queue.rejected().is_empty());
    assert_eq!(queue.unacked_count(), 0);
    assert_eq!(manager.consumer_stats(JOBS).unwrap().retried, 2);
    manager.close().unwrap();
}

#[test]
fn publish_to_unregistered_queue_fails_without_broker_write() {
    let (broker, manager) = start(settings(3, Duration::from_millis(10), 10));

    let err = manager.publish_payload(JOBS, "job", &1).unwrap_err();
    assert!(matches!(err, QueueError::UnknownQueue(name) if name == JOBS));
    assert!(broker.queue(JOBS_BROKER).is_none());
}

#[test]
fn duplicate_registration_keeps_the_first_handler() {
    let (_broker, manager) = start(settings(0, Duration::from_millis(10), 10));

    let first_calls = Arc::new(AtomicUsize::new(0));
    let first = FnHandler::new(binding(1, 10), {
        let calls = first_calls.clone();
        move |_: &Envelope| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    let second = FnHandler::new(binding(1, 10), |_: &Envelope| -> Result<(), HandlerError> {
        panic!("second handler must never run")
    });

    manager.register_handler(Arc::new(first)).unwrap();
    assert!(matches!(
        manager.register_handler(Arc::new(second)),
        Err(QueueError::AlreadyRegistered(_))
    ));

    manager.publish_payload(JOBS, "job", &"x").unwrap();
    assert!(eventually(Duration::from_secs(5), || {
        first_calls.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(manager.consumer_stats(JOBS).unwrap().panicked, 0);
    manager.close().unwrap();
}

#[test]
fn concurrent_publishes_respect_prefetch_limit() {
    const MESSAGES: usize = 200;
    const PREFETCH: usize = 4;
    const CONSUMERS: usize = 3;

    let (broker, manager) = start(settings(3, Duration::from_millis(10), PREFETCH));

    let processed = Arc::new(Mutex::new(HashSet::new()));
    let handler = FnHandler::new(binding(CONSUMERS, PREFETCH), {
        let processed = processed.clone();
        move |env: &Envelope| {
            thread::sleep(Duration::from_millis(1));
            processed.lock().unwrap().insert(env.id());
            Ok(())
        }
    });
    manager.register_handler(Arc::new(handler)).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let manager = manager.clone();
            thread::spawn(move || {
                for i in 0..MESSAGES / 4 {
                    manager.publish_payload(JOBS, "job", &(p, i)).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(eventually(Duration::from_secs(10), || {
        processed.lock().unwrap().len() == MESSAGES
    }));

    let queue = broker.queue(JOBS_BROKER).unwrap();
    assert!(eventually(Duration::from_secs(2), || queue.acked_count() == MESSAGES as u64));
    assert!(queue.peak_unacked() <= PREFETCH, "peak {}", queue.peak_unacked());
    assert_eq!(manager.stats(JOBS).unwrap().consumers, CONSUMERS);
    manager.close().unwrap();
}

#[test]
fn panicking_handler_does_not_kill_its_worker() {
    let (_broker, manager) = start(settings(0, Duration::from_millis(10), 10));

    let ok = Arc::new(AtomicUsize::new(0));
    let handler = FnHandler::new(binding(1, 10), {
        let ok = ok.clone();
        move |env: &Envelope| {
            let n: u32 = env.decode_payload()?;
            if n % 2 == 0 {
                panic!("even payload {n}");
            }
            ok.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    manager.register_handler(Arc::new(handler)).unwrap();

    for n in 0..6u32 {
        manager.publish_payload(JOBS, "job", &n).unwrap();
    }

    assert!(eventually(Duration::from_secs(5), || {
        manager.consumer_stats(JOBS).unwrap().processed == 6
    }));
    assert_eq!(ok.load(Ordering::SeqCst), 3);
    let stats = manager.consumer_stats(JOBS).unwrap();
    assert_eq!((stats.panicked, stats.rejected), (3, 3));
    manager.close().unwrap();
}

#[test]
fn email_message_is_validated_and_acknowledged_once() {
    let mut settings = settings(3, Duration::from_millis(10), 10);
    settings.queues.remove(JOBS);
    let (broker, manager) = start(settings.clone());

    register_queue_handlers(&manager, &settings, Arc::new(LogMailer::new(Duration::ZERO)))
        .unwrap();
    assert_eq!(
        manager.handler(EMAIL_QUEUE).map(|h| h.queue_name().to_string()),
        Some(EMAIL_QUEUE.to_string())
    );

    let raw = br#"{"to":["a@x.com"],"subject":"s","body":"b"}"#;
    manager
        .publish(EMAIL_QUEUE, &Envelope::new(SEND_EMAIL, raw.to_vec()))
        .unwrap();

    let queue = broker.queue("email_queue").unwrap();
    assert!(eventually(Duration::from_secs(5), || queue.acked_count() == 1));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.acked_count(), 1);
    assert_eq!(queue.published_count(), 1);
    assert!(queue.rejected().is_empty());
    manager.close().unwrap();
}

#[test]
fn invalid_email_is_retried_then_rejected() {
    let mut settings = settings(1, Duration::from_millis(10), 10);
    settings.queues.remove(JOBS);
    let (broker, manager) = start(settings.clone());
    register_queue_handlers(&manager, &settings, Arc::new(LogMailer::new(Duration::ZERO)))
        .unwrap();

    let raw = br#"{"to":[],"subject":"s","body":"b"}"#;
    manager
        .publish(EMAIL_QUEUE, &Envelope::new(SEND_EMAIL, raw.to_vec()))
        .unwrap();

    let queue = broker.queue("email_queue").unwrap();
    assert!(eventually(Duration::from_secs(5), || queue.rejected().len() == 1));
    assert_eq!(queue.published_count(), 2);
    manager.close().unwrap();
}
