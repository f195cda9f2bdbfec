use log::info;

use crate::SendableError;
use crate::logger::{self, LoggerConfig, print_env};

/// Install logging and panic logging, then announce the process.
pub fn startup(name: &str, config: &LoggerConfig) -> Result<(), SendableError> {
    logger::setup_logger(config)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
