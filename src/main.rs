mod batch;
mod cli;
mod config;
mod engine;
mod error;
mod hooks;
mod loader;
mod metadata;
mod migrator;
mod paths;
mod registry;
mod scratch;
#[cfg(test)]
mod testing;
mod verify;
mod version;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cli::Cli;
use config::{Config, CONFIG};
use directories::ProjectDirs;
use error::MigrateError;
use flexi_logger::{detailed_format, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{debug, error};

const LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 5;

fn main() {
    let Some(project_dirs) = ProjectDirs::from("", "", "h2migrate") else {
        eprintln!("Could not determine the project data directory");
        std::process::exit(1);
    };

    let config = CONFIG.get_or_init(|| Config::load_config(&project_dirs));

    // Keep the handle alive so buffered log lines are flushed on exit
    let _logger = match setup_logging(&project_dirs, config) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    let interrupt_token = Arc::new(AtomicBool::new(false));
    let handler_token = Arc::clone(&interrupt_token);
    if let Err(e) = ctrlc::set_handler(move || {
        eprintln!("Interrupt requested, stopping after the current step");
        handler_token.store(true, Ordering::Release);
    }) {
        error!("Failed to install the interrupt handler: {}", e);
    }

    if let Err(err) = Cli::handle_command_line(&project_dirs, interrupt_token) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

/// Logs to rotating files in the data directory and copies warnings and
/// errors to stderr
fn setup_logging(project_dirs: &ProjectDirs, config: &Config) -> Result<LoggerHandle, MigrateError> {
    let log_spec = format!("h2migrate={}", config.logging.h2migrate);
    let log_dir = project_dirs.data_local_dir().join("logs");

    let handle = Logger::try_with_str(&log_spec)?
        .log_to_file(FileSpec::default().directory(log_dir).basename("h2migrate"))
        .rotate(
            Criterion::Size(LOG_FILE_SIZE),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(LOG_FILES_KEPT),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_files(detailed_format)
        .start()?;

    Ok(handle)
}
