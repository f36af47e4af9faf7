//! Configuration for `serial-link`.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `SERIAL_LINK_CONFIG` environment variable (explicit path)
//! 2. `./serial-link.toml` (current directory)
//! 3. `~/.config/serial-link/config.toml` (XDG on Linux/macOS)
//! 4. `%APPDATA%\serial-link\config.toml` (Windows)
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! Any configuration value can be overridden via environment variables.
//! The pattern is: `SERIAL_LINK_<SECTION>_<KEY>`
//!
//! Examples:
//! - `SERIAL_LINK_SERIAL_BAUD_RATE=115200`
//! - `SERIAL_LINK_ENGINE_PIN_POLL_INTERVAL_MS=5`
//! - `SERIAL_LINK_LOGGING_FORMAT=json`
//!
//! # Example
//!
//! ```rust,no_run
//! use serial_link::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let settings = loader.config().serial.to_port_settings()?;
//! println!("Default baud: {}", settings.baud_rate);
//! # Ok::<(), serial_link::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{
    Config, EngineConfig, LogFormat, LoggingConfig, RegistryConfig, SerialConfig,
};
