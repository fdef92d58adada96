use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{PipelineError, Result};

pub const DEFAULT_DIRECTIVE: &str = "site_risk=info";
pub const LOG_FILE_PREFIX: &str = "site_risk.log";

/// Initializes the logging system with both console and file output.
///
/// `RUST_LOG` is honored; `default_directive` is added on top of it. The
/// returned guard flushes the file writer when dropped, so the caller keeps it
/// alive for the life of the process.
pub fn init_logging(log_dir: &Path, default_directive: &str) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    // Create a non-blocking file appender for daily log rotation
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Create a JSON layer for file logging
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    // Create a formatted layer for console logging
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let directive = default_directive
        .parse()
        .map_err(|e| PipelineError::Config(format!("invalid log directive '{}': {}", default_directive, e)))?;

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(directive))
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| PipelineError::Config(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}
