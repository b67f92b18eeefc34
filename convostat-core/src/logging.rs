//! Tracing setup.
//!
//! The CLI logs to a daily-rotated file under `$XDG_STATE_HOME/convostat/`.
//! `RUST_LOG` takes precedence over `[logging] level`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};

/// Prefix of the rotated log files; the date is appended per file.
pub const LOG_FILE_PREFIX: &str = "convostat.log";

/// Keeps the background writer alive. Pending lines are flushed on drop.
pub struct LoggingGuard {
    _worker: WorkerGuard,
}

/// Install the global subscriber writing to the state directory.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|value| !value.trim().is_empty());
    let filter = build_filter(config, directive.as_deref())?;

    let log_dir = Config::state_dir();
    let appender = rolling_appender(&log_dir, config.max_files)?;
    let (writer, worker) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );
    Ok(LoggingGuard { _worker: worker })
}

/// Filter from an explicit directive, falling back to the configured level.
///
/// A configured level that does not parse is a config error; a bad
/// `RUST_LOG` is reported the same way so typos do not silently log nothing.
fn build_filter(config: &LoggingConfig, directive: Option<&str>) -> Result<EnvFilter> {
    let (source, directive) = match directive {
        Some(directive) => ("RUST_LOG", directive),
        None => ("logging.level", config.level.as_str()),
    };
    EnvFilter::try_new(directive)
        .map_err(|e| Error::Config(format!("invalid {} '{}': {}", source, directive, e)))
}

fn rolling_appender(dir: &Path, max_files: usize) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(max_files.max(1))
        .build(dir)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))
}

/// Test subscriber writing through the test harness; safe to call repeatedly.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
