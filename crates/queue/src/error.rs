use courier_core::ConfigError;

use crate::broker::BrokerError;
use crate::envelope::EnvelopeError;

/// Queue manager error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("no queue config for {0}")]
    UnknownConfig(String),

    #[error("queue {0} is not registered")]
    UnknownQueue(String),

    #[error("handler already registered for queue {0}")]
    AlreadyRegistered(String),

    #[error("invalid handler for queue {queue}: {reason}")]
    InvalidHandler { queue: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The broker did not answer the startup ping.
    #[error("broker unreachable: {0}")]
    Connectivity(#[source] BrokerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("queue manager is closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;
