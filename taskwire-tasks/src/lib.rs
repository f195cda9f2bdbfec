//! At-least-once task queue on top of [`taskwire_broker`].
//!
//! Producers [`TaskBroker::submit`] calls of declared tasks; workers pull the
//! resulting messages, run the task and ack it, or requeue it on failure.

pub mod broker;
pub mod errors;
pub mod task;
pub mod wiring;
pub mod worker;

pub use broker::TaskBroker;
pub use errors::{ArgumentError, TaskBrokerError, TaskError, WiringError};
pub use task::{TaskArgs, TaskImpl, TaskInvocation, TaskOrigin};
pub use wiring::{AutoWiring, HardWiring, TaskIdentity, TaskWiring};
pub use worker::{run_worker, WorkerReport};
