//! Tasks every worker binary knows about, handy for smoke-testing a broker.

use std::thread;
use std::time::Duration;

use log::info;
use taskwire_tasks::{AutoWiring, TaskArgs, TaskError, TaskImpl, WiringError, task};

pub const QUEUE: &str = "taskwire";

/// Log the arguments it was called with.
pub fn echo(args: &TaskArgs) -> Result<(), TaskError> {
    info!("echo {}", serde_json::to_string(args)?);
    Ok(())
}

/// Block for the number of seconds given as the first argument or `seconds`.
pub fn sleep(args: &TaskArgs) -> Result<(), TaskError> {
    let seconds: f64 = match args.args.first() {
        Some(_) => args.arg(0)?,
        None => args.kwarg("seconds")?,
    };
    let duration = Duration::try_from_secs_f64(seconds)?;
    thread::sleep(duration);
    info!("slept for {:.3} seconds", duration.as_secs_f64());
    Ok(())
}

pub fn tasks() -> Vec<TaskImpl> {
    vec![task!(echo, queue = QUEUE), task!(sleep, queue = QUEUE)]
}

pub fn wiring() -> Result<AutoWiring, WiringError> {
    AutoWiring::new(tasks())
}
