//! Command line front end shared by the `taskwire` binary and by applications
//! that ship their own task wiring:
//!
//! ```no_run
//! fn main() -> Result<(), taskwire_utilities::SendableError> {
//!     let wiring = taskwire_worker::builtin::wiring()?;
//!     taskwire_worker::run(wiring)
//! }
//! ```

pub mod builtin;
pub mod config;

use std::sync::Arc;

use log::info;
use taskwire_broker::client_from_uri;
use taskwire_broker::uri::redacted;
use taskwire_tasks::{TaskBroker, TaskWiring};
use taskwire_utilities::SendableError;
use taskwire_utilities::startup::startup;

use crate::config::{Action, Config, parse_config};

/// Parse the command line, set up logging and run the requested command.
pub fn run(wiring: impl TaskWiring + 'static) -> Result<(), SendableError> {
    let config = parse_config()?;
    startup("taskwire", &config.logging)?;
    execute(config, Arc::new(wiring))
}

pub fn execute(config: Config, wiring: Arc<dyn TaskWiring>) -> Result<(), SendableError> {
    info!("Using broker {}", redacted(&config.broker_uri));
    let client = client_from_uri(&config.broker_uri)?;
    let tasks = TaskBroker::new(client)
        .with_shared_wiring(wiring)
        .with_queue_prefix(config.queue_prefix);

    match config.action {
        Action::Worker {
            queues,
            time_limit,
            task_limit,
        } => {
            tasks.create_queues(&queues)?;
            let report = tasks.run_worker(&queues, time_limit, task_limit)?;
            info!(
                "Worker stopped after {} task(s): {} succeeded, {} requeued",
                report.processed, report.succeeded, report.requeued
            );
        }
        Action::Submit { task, args } => {
            tasks.submit_by_name(&task, args)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use taskwire_tasks::TaskArgs;
    use taskwire_utilities::logger::LoggerConfig;

    fn config(action: Action) -> Config {
        Config {
            logging: LoggerConfig::default(),
            broker_uri: "memory://".into(),
            queue_prefix: "test-".into(),
            action,
        }
    }

    fn builtin() -> Arc<dyn TaskWiring> {
        Arc::new(builtin::wiring().unwrap())
    }

    #[test]
    fn submit_resolves_the_task_name() {
        let action = Action::Submit {
            task: "taskwire_worker::builtin:echo".into(),
            args: TaskArgs::new().with_arg("hello"),
        };
        assert!(execute(config(action), builtin()).is_ok());
    }

    #[test]
    fn submit_of_unknown_task_fails() {
        let action = Action::Submit {
            task: "nowhere:nothing".into(),
            args: TaskArgs::new(),
        };
        assert!(execute(config(action), builtin()).is_err());
    }

    #[test]
    fn worker_stops_at_its_time_limit() {
        let action = Action::Worker {
            queues: vec!["taskwire".into()],
            time_limit: Some(Duration::ZERO),
            task_limit: None,
        };
        assert!(execute(config(action), builtin()).is_ok());
    }

    #[test]
    fn unsupported_broker_is_reported() {
        let mut config = config(Action::Worker {
            queues: vec!["taskwire".into()],
            time_limit: Some(Duration::ZERO),
            task_limit: None,
        });
        config.broker_uri = "redis://localhost".into();
        assert!(execute(config, builtin()).is_err());
    }
}
