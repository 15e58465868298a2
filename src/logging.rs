use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Wire up tracing with two sinks: human-readable console output and a
/// daily-rotated JSON file under `logs/` for later inspection of runs.
pub fn init_logging() {
    let _ = fs::create_dir_all("logs");

    let file_appender = tracing_appender::rolling::daily("logs", "prepa_etl.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("prepa_etl=info".parse().unwrap()))
        .with(file_layer)
        .with(console_layer)
        .init();

    // The guard flushes the file writer when dropped; leak it so the file
    // sink stays live for the whole process.
    std::mem::forget(_guard);
}
