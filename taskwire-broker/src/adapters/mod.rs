//! Adapters for real brokers. Each one drives an async client library from
//! the synchronous contract through its own single-threaded tokio runtime.

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(any(feature = "amqp", feature = "sqs"))]
pub(crate) fn build_runtime(backend: &str) -> Result<tokio::runtime::Runtime, crate::BrokerError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            crate::BrokerError::Connection(format!("failed to start {backend} runtime: {err}"))
        })
}
