use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system with the specified log level.
///
/// # Arguments
///
/// * `log_level` - The desired log level or filter directive (e.g. "info", "tasklink=debug")
/// * `log_dir` - When set, logs are also written to a daily rotating `tasklink.log` there
pub fn init_logging(log_level: &str, log_dir: Option<&Path>) {
    let filter = match EnvFilter::try_new(log_level) {
        Ok(f) => f,
        Err(_) => {
            eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
            EnvFilter::new("info")
        }
    };

    let stdout_layer = fmt::layer().with_line_number(true);

    if let Some(dir) = log_dir {
        let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "tasklink.log");

        let file_layer = fmt::layer()
            .with_line_number(true)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
    }
}
