pub mod adapters;
mod errors;
pub mod listen;
pub mod memory;
mod message;
mod session;
pub mod uri;

pub use errors::BrokerError;
pub use listen::{Listen, Polling, Receiver};
pub use message::{DeliveryToken, Headers, Message, RawDelivery};
pub use session::{session, Session};
pub use uri::client_from_uri;

use std::time::Duration;

/// Contract implemented by every queue backend.
///
/// Methods take `&self` so that a listen sequence can stay alive while the
/// caller acks or requeues the messages it yields. A client is not meant to be
/// driven from several threads at once without external synchronization.
pub trait BrokerClient: Send + Sync {
    /// Open the backend session. Calling it on a connected client is a no-op.
    fn connect(&self) -> Result<(), BrokerError>;

    /// Close the backend session. Calling it on a closed client is a no-op.
    fn disconnect(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Create a queue; succeeds if it already exists.
    fn create_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Delete a queue and everything in it; succeeds if it does not exist.
    fn destroy_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Durably send the body and headers of `message` to `message.queue`.
    fn publish(&self, message: &Message) -> Result<(), BrokerError>;

    /// Lazily receive messages from `queues` until `time_limit` runs out.
    ///
    /// `None` listens forever, `Some(Duration::ZERO)` checks each queue once.
    fn listen(&self, queues: &[String], time_limit: Option<Duration>)
        -> Result<Listen<'_>, BrokerError>;

    /// Permanently remove a received message from its queue.
    fn ack(&self, message: &Message) -> Result<(), BrokerError>;

    /// Make a received message visible again immediately.
    fn requeue(&self, message: &Message) -> Result<(), BrokerError>;
}
