use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,taskcal_core=debug";
const LOG_FILE_PREFIX: &str = "taskcal.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber: human-readable console output plus
/// daily-rotated JSON lines under `logs_dir`.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Returns `None` when a subscriber is already set.
pub fn init_tracing(logs_dir: &Path) -> Option<WorkerGuard> {
    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let result = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(true).with_line_number(true))
        .with(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_writer(file_writer),
        )
        .try_init();

    match result {
        Ok(()) => Some(guard),
        Err(error) => {
            tracing::debug!(error = %error, "tracing subscriber already set, continuing");
            None
        }
    }
}
