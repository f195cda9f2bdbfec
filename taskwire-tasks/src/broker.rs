use std::sync::Arc;
use std::time::Duration;

use log::info;
use taskwire_broker::{session, BrokerClient, BrokerError, Message};

use crate::errors::{TaskBrokerError, WiringError};
use crate::task::{TaskArgs, TaskImpl, TaskInvocation};
use crate::wiring::{AutoWiring, TaskIdentity, TaskWiring};
use crate::worker::{self, WorkerReport};

enum Wiring {
    Auto(AutoWiring),
    Custom(Arc<dyn TaskWiring>),
}

/// Producer and consumer side of a task queue over one broker client.
///
/// Every queue name is prefixed with the configured prefix, both when
/// submitting and when running a worker, so both sides agree on physical
/// queue names.
pub struct TaskBroker {
    client: Box<dyn BrokerClient>,
    wiring: Wiring,
    queue_prefix: String,
}

impl TaskBroker {
    /// Broker using automatic wiring with no registered tasks.
    pub fn new(client: Box<dyn BrokerClient>) -> Self {
        Self {
            client,
            wiring: Wiring::Auto(AutoWiring::default()),
            queue_prefix: String::new(),
        }
    }

    pub fn with_wiring(mut self, wiring: impl TaskWiring + 'static) -> Self {
        self.wiring = Wiring::Custom(Arc::new(wiring));
        self
    }

    pub fn with_shared_wiring(mut self, wiring: Arc<dyn TaskWiring>) -> Self {
        self.wiring = Wiring::Custom(wiring);
        self
    }

    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    /// Queue for tasks declared without one. Only valid with the built-in
    /// automatic wiring.
    pub fn with_default_queue(self, queue: impl Into<String>) -> Result<Self, WiringError> {
        match self.wiring {
            Wiring::Auto(auto) => Ok(Self {
                wiring: Wiring::Auto(auto.with_default_queue(queue)),
                ..self
            }),
            Wiring::Custom(_) => Err(WiringError::DefaultQueueConflict),
        }
    }

    pub fn wiring(&self) -> &dyn TaskWiring {
        match &self.wiring {
            Wiring::Auto(auto) => auto,
            Wiring::Custom(custom) => custom.as_ref(),
        }
    }

    /// Physical name of a logical queue.
    pub fn queue_name(&self, queue: &str) -> String {
        format!("{}{}", self.queue_prefix, queue)
    }

    /// Publish a call of `task` to its queue.
    pub fn submit(&self, task: &TaskImpl, args: TaskArgs) -> Result<(), TaskBrokerError> {
        let identity = self.wiring().identity_of(task)?;
        self.publish(identity, args)
    }

    /// Publish a call of the task wired under `name`.
    pub fn submit_by_name(&self, name: &str, args: TaskArgs) -> Result<(), TaskBrokerError> {
        let task = self.wiring().resolve(name)?;
        self.submit(&task, args)
    }

    fn publish(&self, identity: TaskIdentity, args: TaskArgs) -> Result<(), TaskBrokerError> {
        let queue = self.queue_name(&identity.queue);
        let body = serde_json::to_value(TaskInvocation::new(identity.name.as_str(), args))?;

        let client = session(&*self.client)?;
        info!("Submitting task {} to queue {}", identity.name, queue);
        client.publish(&Message::new(queue, body))?;
        client.close()?;
        Ok(())
    }

    pub fn create_queues<I, S>(&self, queues: I) -> Result<(), BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let client = session(&*self.client)?;
        for queue in queues {
            client.create_queue(&self.queue_name(queue.as_ref()))?;
        }
        client.close()
    }

    pub fn destroy_queues<I, S>(&self, queues: I) -> Result<(), BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let client = session(&*self.client)?;
        for queue in queues {
            client.destroy_queue(&self.queue_name(queue.as_ref()))?;
        }
        client.close()
    }

    pub fn run_worker<I, S>(
        &self,
        queues: I,
        time_limit: Option<Duration>,
        task_limit: Option<usize>,
    ) -> Result<WorkerReport, BrokerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let queues: Vec<String> = queues
            .into_iter()
            .map(|queue| self.queue_name(queue.as_ref()))
            .collect();
        worker::run_worker(
            &*self.client,
            &queues,
            self.wiring(),
            time_limit,
            task_limit,
        )
    }
}
