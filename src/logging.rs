//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; binaries decide where they go by
//! calling [`init_logging`] once at startup.

use crate::config::{LogFormat, LoggingConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log level '{level}': {message}")]
    InvalidLevel { level: String, message: String },

    #[error("Failed to open log file {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. Returns `Ok(false)` if a
/// global subscriber was already installed, in which case nothing changes.
pub fn init_logging(config: &LoggingConfig) -> Result<bool, LoggingError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| LoggingError::InvalidLevel {
            level: config.level.clone(),
            message: e.to_string(),
        })?,
    };

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_target(true)
        .with_thread_names(true);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    Ok(tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwritable_log_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Compact,
            file: Some(dir.path().join("missing").join("serial-link.log")),
        };
        assert!(matches!(
            init_logging(&config),
            Err(LoggingError::File { .. })
        ));
    }
}
