//! Logging setup for the binary

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE: &str = "kestrel.log";

/// Filter used when `RUST_LOG` is not set
pub fn default_filter(level: &str) -> String {
    format!("{},kestrel=debug,sqlx=warn", level)
}

/// `rolling::daily` aborts when it cannot create its first file, so check
/// the directory up front.
fn log_dir_writable(dir: &str) -> Result<(), std::io::Error> {
    std::fs::create_dir_all(dir)?;
    let probe = Path::new(dir).join(".kestrel_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file logging is on; keep it alive for
/// the lifetime of the process or buffered lines are lost.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));

    let mut guard = None;
    let file_layer = match config.log_dir.as_deref() {
        Some(dir) => match log_dir_writable(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not write to log directory {} ({}), file logging disabled",
                    dir, e
                );
                None
            }
        },
        None => None,
    };

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let plain_layer = (!config.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
    });

    let file_logging = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(plain_layer)
        .with(file_layer)
        .init();

    if file_logging {
        if let Some(dir) = &config.log_dir {
            eprintln!("Logging to: {}/{}", dir, LOG_FILE);
        }
    }
    guard
}

/// Minimal logging for one-shot commands
pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
