//! Structured logging setup.
//!
//! Console output is pretty-printed by default and JSON with `LOG_JSON=true`;
//! `LOG_FILE` adds a daily-rotated JSON file. `RUST_LOG` always wins over the
//! level passed in.
//!
//! ```bash
//! RUST_LOG=dex_state_sync=debug cargo run -- simulate
//! LOG_JSON=true LOG_FILE=./logs/sync.log cargo run -- watch
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{SyncError, SyncResult};

/// Filter used when neither `RUST_LOG` nor a level is given.
pub const DEFAULT_FILTER: &str = "dex_state_sync=info,warn";

/// Install the global tracing subscriber.
///
/// Returns the file appender's guard when file logging is enabled; it must
/// live until shutdown or buffered lines are lost.
///
/// # Errors
///
/// Returns a configuration error when the log directory cannot be created or
/// a global subscriber is already installed.
pub fn init_tracing(
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    json_output: bool,
) -> SyncResult<Option<WorkerGuard>> {
    let env_filter = if let Ok(filter) = std::env::var("RUST_LOG") {
        EnvFilter::new(filter)
    } else if let Some(level) = log_level {
        EnvFilter::new(level)
    } else {
        EnvFilter::new(DEFAULT_FILTER)
    };

    let console_layer = if json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    };

    let mut guard = None;
    let file_layer = match log_file.as_deref() {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory).map_err(|e| {
                SyncError::config(
                    format!("Cannot create log directory {}", directory.display()),
                    Some(Box::new(e)),
                )
            })?;

            let appender = tracing_appender::rolling::daily(
                directory,
                path.file_name().unwrap_or_else(|| OsStr::new("sync.log")),
            );
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);

            Some(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .boxed(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| SyncError::config("Tracing already initialized", Some(Box::new(e))))?;

    info!(
        json_output,
        file_logging = log_file.is_some(),
        "Tracing initialized"
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let _ = init_tracing(Some("warn".to_string()), None, false);
        let second = init_tracing(Some("warn".to_string()), None, true);
        assert!(second.is_err());
    }

    #[test]
    fn test_file_logging_creates_directory() {
        let Ok(dir) = tempfile::tempdir() else {
            return;
        };
        let log_file = dir.path().join("logs").join("sync.log");

        // Installing may fail if another test got there first; the directory
        // is created either way.
        let _ = init_tracing(None, Some(log_file), true);

        assert!(dir.path().join("logs").is_dir());
    }
}
