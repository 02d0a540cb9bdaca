use std::fs;
use std::path::Path;

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::Subscriber;
use tracing_subscriber::EnvFilter;

use crate::errors::{ProgressError, Result};

const LOG_FILE_PREFIX: &str = "progress.log";

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Routes `tracing` output to a daily-rolling file under `log_dir`.
///
/// The filter comes from `RUST_LOG` and falls back to `info`. Calling this
/// twice returns a config error from the second global-default install.
pub fn init(log_dir: &Path) -> Result<()> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    let subscriber = Subscriber::builder()
        .with_env_filter(default_filter())
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| ProgressError::Config(err.to_string()))?;

    Ok(())
}

/// Stderr-only variant for runs without a writable root directory.
pub fn init_stderr() -> Result<()> {
    let subscriber = Subscriber::builder()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| ProgressError::Config(err.to_string()))
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
