use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("failed to publish to queue {queue}: {reason}")]
    Publish { queue: String, reason: String },
    #[error("queue operation on {queue} failed: {reason}")]
    Queue { queue: String, reason: String },
    #[error("delivery error: {0}")]
    Delivery(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("listen requires at least one queue")]
    NoQueues,
    #[error("invalid broker uri: {0}")]
    InvalidUri(String),
    #[error("unsupported broker scheme: {0}")]
    UnsupportedScheme(String),
    #[error("broker backend not compiled in: enable the `{0}` feature")]
    FeatureDisabled(&'static str),
}

impl BrokerError {
    pub(crate) fn not_connected(backend: &str) -> Self {
        BrokerError::Connection(format!("not connected to {backend} broker"))
    }

    pub(crate) fn publish(queue: &str, reason: impl ToString) -> Self {
        BrokerError::Publish {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn queue(queue: &str, reason: impl ToString) -> Self {
        BrokerError::Queue {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }
}
