use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes console and daily JSON file logging under `dir`.
pub fn init_logging(dir: &str) {
    let _ = fs::create_dir_all(dir);

    let file_appender = tracing_appender::rolling::daily(dir, "observatory.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "observatory=info".parse() {
        filter = filter.add_directive(directive);
    }

    // try_init: tests and embedding hosts may already own the global subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    // The guard flushes on drop, so keep it for the life of the process
    std::mem::forget(guard);
}
