//! Process-wide queue manager.
//!
//! The queue crate never holds global state; the binary initialises one
//! manager here and producers look it up.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::debug;

use courier_core::QueueSettings;
use courier_queue::{Broker, QueueManager, QueueResult};

static MANAGER: OnceLock<Arc<QueueManager>> = OnceLock::new();
static INIT: Mutex<()> = Mutex::new(());

/// Open the process-wide manager.
///
/// After the first success, later calls return the existing instance and
/// ignore their arguments. A failed attempt leaves the slot empty.
pub fn init_manager(
    settings: QueueSettings,
    broker: Arc<dyn Broker>,
) -> QueueResult<Arc<QueueManager>> {
    if let Some(existing) = MANAGER.get() {
        debug!("queue manager already initialised");
        return Ok(existing.clone());
    }

    let _guard = INIT.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = MANAGER.get() {
        return Ok(existing.clone());
    }

    let manager = QueueManager::open(settings, broker)?;
    Ok(MANAGER.get_or_init(|| manager).clone())
}

/// The process-wide manager, if initialised.
pub fn manager() -> Option<Arc<QueueManager>> {
    MANAGER.get().cloned()
}
