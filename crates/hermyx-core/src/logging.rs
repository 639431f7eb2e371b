//! Logging initialization.
//!
//! Builds the tracing subscriber from [`LogConfig`]: an optional stdout
//! layer, an optional file layer, and an `EnvFilter` whose default level is
//! lifted to `debug` when `debugEnabled` is set. `RUST_LOG` always wins over
//! the config file.
//!
//! The file writer is non-blocking with a bounded buffer; when the buffer is
//! full, lines are dropped rather than stalling request handlers.

use crate::config::LogConfig;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on queued log lines before the writer starts dropping.
const LOG_BUFFER_LINES: usize = 10_000;

/// Initializes the global tracing subscriber.
///
/// Returns the worker guard for the file appender, if any; the caller must
/// keep it alive for the lifetime of the process or buffered lines are lost
/// on exit.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, io::Error> {
    let default_directive =
        if config.debug_enabled { "hermyx_core=debug,hermyx_cli=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let mut guard = None;
    let file_writer = match (config.to_file, &config.file_path) {
        (true, Some(path)) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new().append(true).create(true).open(path)?;
            let (writer, file_guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
                .buffered_lines_limit(LOG_BUFFER_LINES)
                .lossy(true)
                .finish(file);
            guard = Some(file_guard);
            Some(writer)
        }
        _ => None,
    };

    let registry = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        let stdout_layer =
            config.to_stdout.then(|| tracing_subscriber::fmt::layer().json());
        let file_layer = file_writer
            .map(|w| tracing_subscriber::fmt::layer().json().with_ansi(false).with_writer(w));
        registry.with(stdout_layer).with(file_layer).init();
    } else {
        let stdout_layer = config.to_stdout.then(|| tracing_subscriber::fmt::layer());
        let file_layer =
            file_writer.map(|w| tracing_subscriber::fmt::layer().with_ansi(false).with_writer(w));
        registry.with(stdout_layer).with(file_layer).init();
    }

    Ok(guard)
}
