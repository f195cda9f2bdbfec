use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use taskwire_tasks::TaskArgs;
use taskwire_utilities::SendableError;
use taskwire_utilities::logger::LoggerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggerConfig,
    pub broker_uri: String,
    pub queue_prefix: String,
    pub action: Action,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Worker {
        queues: Vec<String>,
        time_limit: Option<Duration>,
        task_limit: Option<usize>,
    },
    Submit {
        task: String,
        args: TaskArgs,
    },
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run task workers and submit tasks", long_about = None)]
pub struct CliArgs {
    /// Log at debug level, including broker client libraries.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct BrokerArgs {
    /// amqp://, amqps://, sqs:// or memory:// URI.
    #[arg(long, env = "TASKWIRE_BROKER_URI")]
    broker_uri: String,

    #[arg(long, env = "TASKWIRE_QUEUE_PREFIX", default_value = "")]
    queue_prefix: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the watched queues and execute tasks from them.
    Worker {
        #[command(flatten)]
        broker: BrokerArgs,

        #[arg(long, env = "TASKWIRE_QUEUES", value_delimiter = ',', default_value = "taskwire")]
        queues: Vec<String>,

        /// Seconds to run before stopping; runs forever when omitted.
        #[arg(long)]
        time_limit: Option<f64>,

        /// Stop after this many tasks.
        #[arg(long)]
        task_limit: Option<usize>,
    },
    /// Submit one call of a wired task.
    Submit {
        task: String,

        #[command(flatten)]
        broker: BrokerArgs,

        #[arg(long, default_value = "[]")]
        args_json: String,

        #[arg(long, default_value = "{}")]
        kwargs_json: String,
    },
}

pub fn parse_config() -> Result<Config, SendableError> {
    Config::from_args(CliArgs::parse())
}

impl Config {
    pub fn from_args(args: CliArgs) -> Result<Self, SendableError> {
        let logging = LoggerConfig {
            verbose: args.verbose,
            log_file: args.log_file,
        };

        let (broker, action) = match args.command {
            Command::Worker {
                broker,
                queues,
                time_limit,
                task_limit,
            } => {
                let queues: Vec<String> = queues
                    .into_iter()
                    .map(|queue| queue.trim().to_string())
                    .filter(|queue| !queue.is_empty())
                    .collect();
                if queues.is_empty() {
                    return Err("at least one queue must be given".into());
                }
                let time_limit = time_limit.map(seconds).transpose()?;
                (
                    broker,
                    Action::Worker {
                        queues,
                        time_limit,
                        task_limit,
                    },
                )
            }
            Command::Submit {
                task,
                broker,
                args_json,
                kwargs_json,
            } => {
                let args = TaskArgs::from_json(&args_json, &kwargs_json).map_err(|err| -> SendableError {
                    format!("invalid task arguments: {err}").into()
                })?;
                (broker, Action::Submit { task, args })
            }
        };

        Ok(Config {
            logging,
            broker_uri: broker.broker_uri,
            queue_prefix: broker.queue_prefix,
            action,
        })
    }
}

fn seconds(value: f64) -> Result<Duration, SendableError> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| format!("time limit must be a non-negative number of seconds, got {value}").into())
}
