//! Errors raised while loading, validating or saving `serial-link` configuration.

use crate::port::PortError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read
    #[error("Cannot read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Not valid TOML, or TOML of the wrong shape
    #[error("Malformed configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Cannot encode configuration as TOML: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// The file or its directory could not be written
    #[error("Cannot write config file {path}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A value parsed but is out of range
    #[error("{key}: {message}")]
    ValidationError { key: String, message: String },

    /// Line settings the port layer refuses
    #[error("{key}: {source}")]
    InvalidSettings {
        key: String,
        #[source]
        source: PortError,
    },

    /// A `SERIAL_LINK_*` override could not be parsed
    #[error("Bad value in ${var}: {message}")]
    EnvParseError { var: String, message: String },

    /// `save` on a loader that was not read from a file
    #[error("Configuration has no file path; use save_to")]
    NoPath,
}

impl ConfigError {
    pub fn validation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn env_parse(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EnvParseError {
            var: var.into(),
            message: message.into(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
