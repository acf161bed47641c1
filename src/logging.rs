use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global subscriber: a daily rolling log file written through a
/// non-blocking appender.
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// flushes buffered lines on drop and must live until shutdown.
pub fn init(config: &LoggingConfig) -> WorkerGuard {
    let directory = config.file.as_deref().unwrap_or_else(|| Path::new("logs"));
    let file_appender = tracing_appender::rolling::daily(directory, "native-llm");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let installed = tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(filter)
        // Log files stay free of escape codes
        .with_ansi(false)
        .with_line_number(true)
        .with_file(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed, keeping it");
    }

    guard
}
