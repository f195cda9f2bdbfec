use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use log::{error, info};
use serde_json::Value;
use taskwire_broker::{session, BrokerClient, BrokerError, Message};

use crate::errors::{TaskError, TaskPanicked};
use crate::task::TaskInvocation;
use crate::wiring::TaskWiring;

/// Counts of what a worker run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: usize,
    pub succeeded: usize,
    pub requeued: usize,
}

struct Failure {
    task_name: String,
    error: TaskError,
}

/// Execute task messages from `queues` until `time_limit` runs out or
/// `task_limit` messages have been handled.
///
/// Each message is acked when its task succeeds and requeued when it fails,
/// panics, or can not be resolved; such failures never end the loop. Broker
/// errors do.
pub fn run_worker(
    client: &dyn BrokerClient,
    queues: &[String],
    wiring: &dyn TaskWiring,
    time_limit: Option<Duration>,
    task_limit: Option<usize>,
) -> Result<WorkerReport, BrokerError> {
    let mut report = WorkerReport::default();
    if task_limit == Some(0) {
        return Ok(report);
    }

    let client = session(client)?;
    info!(
        "Worker started, watching queues {:?} for tasks {:?}",
        queues,
        wiring.task_names()
    );

    for received in client.listen(queues, time_limit)? {
        let message = received?;
        let started = Instant::now();
        match execute(&message, wiring) {
            Ok(task_name) => {
                info!(
                    "Task {} succeeded in {:.3} seconds",
                    task_name,
                    started.elapsed().as_secs_f64()
                );
                client.ack(&message)?;
                report.succeeded += 1;
            }
            Err(failure) => {
                error!(
                    "Error running task {}, requeuing: {}",
                    failure.task_name, failure.error
                );
                client.requeue(&message)?;
                report.requeued += 1;
            }
        }
        report.processed += 1;

        if let Some(limit) = task_limit.filter(|limit| report.processed >= *limit) {
            info!("Worker hit task limit of {}, terminating", limit);
            break;
        }
    }

    client.close()?;
    Ok(report)
}

fn execute(message: &Message, wiring: &dyn TaskWiring) -> Result<String, Failure> {
    let invocation: TaskInvocation =
        serde_json::from_value(message.body.clone()).map_err(|err| Failure {
            task_name: claimed_name(&message.body),
            error: Box::new(err),
        })?;
    let fail = |error: TaskError| Failure {
        task_name: invocation.task_name.clone(),
        error,
    };

    let task = wiring
        .resolve(&invocation.task_name)
        .map_err(|err| fail(Box::new(err)))?;
    let args = invocation.arguments();
    match panic::catch_unwind(AssertUnwindSafe(|| task.call(&args))) {
        Ok(Ok(())) => Ok(invocation.task_name.clone()),
        Ok(Err(err)) => Err(fail(err)),
        Err(payload) => Err(fail(Box::new(TaskPanicked(panic_message(payload.as_ref()))))),
    }
}

fn claimed_name(body: &Value) -> String {
    body.get("task_name")
        .and_then(Value::as_str)
        .unwrap_or("<unparsable>")
        .to_string()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
