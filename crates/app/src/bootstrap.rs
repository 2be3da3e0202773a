//! Startup wiring: broker selection, manager initialisation, handler
//! registration.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use courier_core::AppConfig;
use courier_queue::{Broker, InMemoryBroker, Mailer, QueueManager, register_queue_handlers};

use crate::runtime;

/// Redis when a broker URL is configured (and the `redis` feature is on),
/// otherwise the non-durable in-memory broker.
pub fn select_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    let url = config
        .broker
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());

    match url {
        #[cfg(feature = "redis")]
        Some(url) => {
            let broker = courier_queue::RedisBroker::new(url, &config.queue.connection.tag)
                .context("invalid broker url")?;
            info!(connection = %broker.connection_name(), "using redis broker");
            Ok(Arc::new(broker))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            warn!("broker url set but redis support is not compiled in; using in-memory broker");
            Ok(Arc::new(InMemoryBroker::new()))
        }
        None => {
            warn!("no broker url configured; using in-memory broker (messages are not durable)");
            Ok(Arc::new(InMemoryBroker::new()))
        }
    }
}

/// Initialise the process-wide manager and register the built-in handlers.
pub fn start(config: &AppConfig, mailer: Arc<dyn Mailer>) -> anyhow::Result<Arc<QueueManager>> {
    let broker = select_broker(config)?;
    let manager = runtime::init_manager(config.queue.clone(), broker)
        .context("failed to initialise queue manager")?;
    register_queue_handlers(&manager, &config.queue, mailer)
        .context("failed to register queue handlers")?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn no_url_selects_in_memory_broker() {
        let mut config = AppConfig::default();
        config.broker.url = Some("   ".to_string());

        let broker = select_broker(&config).unwrap();
        assert!(broker.ping(Duration::from_secs(1)).is_ok());
    }

    #[cfg(feature = "redis")]
    #[test]
    fn malformed_url_is_an_error() {
        let mut config = AppConfig::default();
        config.broker.url = Some("definitely not a url".to_string());

        assert!(select_broker(&config).is_err());
    }
}
