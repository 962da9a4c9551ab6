//! Log sink construction.
//!
//! The caller owns the returned [`LogHandle`]: it installs the dispatch as
//! the process default (or not) and hands a clone to the pipeline. Dropping
//! the handle flushes the file writer.

use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::LoggingError;

/// Log file name inside `logging.directory`.
pub const LOG_FILE_NAME: &str = "fetchses.log";

/// A configured subscriber plus whatever keeps its writer alive.
pub struct LogHandle {
    dispatch: Dispatch,
    _guard: Option<WorkerGuard>,
}

impl LogHandle {
    /// The subscriber to log through.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }
}

/// Build the subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.level` when set.
pub fn init(config: &LoggingConfig) -> Result<LogHandle, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| LoggingError::Filter {
            filter: config.level.clone(),
            reason: e.to_string(),
        })?,
    };

    if config.console {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        return Ok(LogHandle {
            dispatch: Dispatch::new(subscriber),
            _guard: None,
        });
    }

    let directory = config.directory.as_ref().ok_or(LoggingError::NoDirectory)?;
    std::fs::create_dir_all(directory).map_err(|source| LoggingError::Directory {
        path: directory.clone(),
        source,
    })?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(directory, LOG_FILE_NAME));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .finish();

    Ok(LogHandle {
        dispatch: Dispatch::new(subscriber),
        _guard: Some(guard),
    })
}
