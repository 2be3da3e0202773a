//! Composition root wiring, exercised the way the binary runs it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use courier_app::email_service::{EmailService, EmailServiceError};
use courier_app::{bootstrap, runtime};
use courier_core::AppConfig;
use courier_queue::{EMAIL_QUEUE, LogMailer, QueueError};

fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn start_send_and_close() {
    assert!(matches!(
        EmailService::from_runtime(),
        Err(EmailServiceError::NotInitialized)
    ));

    let mut config = AppConfig::from_toml_str(
        r#"
        [queue.rmq]
        poll_duration = "10ms"
        retry_delay = "50ms"
        drain_timeout = "2s"
        shutdown_timeout = "2s"
        "#,
    )
    .unwrap();
    config.broker.url = None;

    let manager = bootstrap::start(&config, Arc::new(LogMailer::new(Duration::ZERO))).unwrap();
    assert!(Arc::ptr_eq(&manager, &runtime::manager().unwrap()));
    assert_eq!(manager.registered_queues(), vec![EMAIL_QUEUE.to_string()]);

    let service = EmailService::from_runtime().unwrap();
    service
        .send_email(vec!["a@x.com".to_string()], "Hello", "Body", false)
        .unwrap();
    service
        .send_email(Vec::new(), "No recipients", "Body", false)
        .unwrap();

    assert!(eventually(Duration::from_secs(5), || {
        let stats = manager.consumer_stats(EMAIL_QUEUE).unwrap();
        stats.acked == 1 && stats.rejected == 1
    }));
    assert_eq!(manager.stats(EMAIL_QUEUE).unwrap().rejected, 1);

    // Re-running startup hits the existing manager, whose email queue is taken.
    assert!(bootstrap::start(&config, Arc::new(LogMailer::default())).is_err());

    manager.close().unwrap();
    assert!(matches!(
        service.send_email(vec!["a@x.com".to_string()], "s", "b", false),
        Err(EmailServiceError::Queue(QueueError::Closed))
    ));
}
