use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use log::{info, Level, LevelFilter};

use crate::SendableError;

/// Transport libraries that are only interesting when debugging.
pub const NOISY_TARGETS: &[&str] = &[
    "lapin",
    "amq_protocol",
    "aws_config",
    "aws_smithy_runtime",
    "aws_sdk_sqs",
    "hyper",
];

#[derive(Debug, Clone, Default)]
pub struct LoggerConfig {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

impl LoggerConfig {
    pub fn level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}

/// One log line: `[<rfc3339> <LEVEL> <target>] <message>`.
pub fn render(now: SystemTime, level: Level, target: &str, message: &fmt::Arguments) -> String {
    format!(
        "[{} {} {}] {}",
        humantime::format_rfc3339_seconds(now),
        level,
        target,
        message
    )
}

pub fn build_dispatch(config: &LoggerConfig) -> Result<fern::Dispatch, SendableError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                render(SystemTime::now(), record.level(), record.target(), message)
            ))
        })
        .level(config.level());

    if !config.verbose {
        for target in NOISY_TARGETS {
            dispatch = dispatch.level_for(*target, LevelFilter::Warn);
        }
    }

    dispatch = dispatch.chain(std::io::stdout());
    if let Some(path) = &config.log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    Ok(dispatch)
}

pub fn setup_logger(config: &LoggerConfig) -> Result<(), SendableError> {
    build_dispatch(config)?.apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
