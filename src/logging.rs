//! Logging setup.
//!
//! `RUST_LOG` wins when set. Otherwise `DEBUG=true` enables debug output,
//! falling back to the configured level. Warnings and errors go to stderr and
//! everything else to stdout, unless a log file is configured, in which case
//! all output is appended to it.

use crate::config::LoggingConfig;
use crate::error::ConfigError;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Local wall-clock timestamps with microsecond precision.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y/%m/%d %H:%M:%S%.6f"))
    }
}

/// Filter directive used when `RUST_LOG` is not set.
fn default_directive(config: &LoggingConfig) -> &str {
    if config.debug {
        "debug"
    } else {
        &config.level
    }
}

/// Install the global subscriber.
pub fn init(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| ConfigError::LogFile {
                    path: path.clone(),
                    source: e,
                })?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => {
            builder
                .with_writer(
                    std::io::stderr
                        .with_max_level(Level::WARN)
                        .or_else(std::io::stdout),
                )
                .init();
        }
    }

    Ok(())
}
