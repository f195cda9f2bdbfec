use taskwire_broker::BrokerError;
use thiserror::Error;

/// Failure returned by a task implementation.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WiringError {
    #[error("no task named {0} is wired")]
    UnknownTask(String),
    #[error("task {0} is not wired")]
    NotWired(String),
    #[error("task implementation was not declared with `task!`")]
    Undeclared,
    #[error("task {0} declares no queue and no default queue is configured")]
    NoQueue(String),
    #[error("task name {0} is wired more than once")]
    DuplicateName(String),
    #[error("the same implementation is wired as both {first} and {second}")]
    DuplicateImplementation { first: String, second: String },
    #[error("a default queue only applies to the built-in automatic wiring")]
    DefaultQueueConflict,
}

#[derive(Debug, Error)]
pub enum TaskBrokerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Wiring(#[from] WiringError),
    #[error("failed to encode task invocation: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Problems reading the arguments handed to a task.
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("missing positional argument {0}")]
    MissingPositional(usize),
    #[error("missing keyword argument {0}")]
    MissingKeyword(String),
    #[error("argument {name} has the wrong type: {source}")]
    Invalid {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
#[error("task panicked: {0}")]
pub struct TaskPanicked(pub String);
