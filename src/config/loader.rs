//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, LogFormat};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SERIAL_LINK";

/// Config file name inside the per-user config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config file name looked up in the working directory
const LOCAL_CONFIG_FILE_NAME: &str = "serial-link.toml";

/// Application directory under the platform config root
const APP_DIR_NAME: &str = "serial-link";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SERIAL_LINK_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SERIAL_LINK_CONFIG` environment variable (explicit path)
    /// 2. `./serial-link.toml` (current directory)
    /// 3. `$XDG_CONFIG_HOME/serial-link/config.toml` (or `~/.config/...`)
    /// 4. `%APPDATA%\serial-link\config.toml` (Windows)
    /// 5. Built-in defaults (no file required)
    ///
    /// Environment variables override file values, and the result is validated.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = match &config_path {
            Some(path) => load_from_file(path)?,
            None => Config::default(),
        };

        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path,
            config,
        })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    ///
    /// Environment overrides still apply; malformed ones are ignored.
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        if let Err(e) = apply_env_overrides(&mut config) {
            tracing::warn!(error = %e, "Ignoring invalid environment override");
            config = Config::default();
        }

        Self {
            config_path: None,
            config,
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }

    /// Save the current configuration to the file it was loaded from.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self.config_path.as_ref().ok_or(ConfigError::NoPath)?;
        save_to_file(&self.config, path)
    }

    /// Save the current configuration to a specific file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "{} points at a missing file", CONFIG_PATH_ENV);
    }

    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    get_default_config_path().filter(|path| path.exists())
}

/// Get the platform-specific config directory.
fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    }

    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

/// Get the default config directory for creating new config files.
pub fn get_default_config_dir() -> Option<PathBuf> {
    get_config_dir().map(|d| d.join(APP_DIR_NAME))
}

/// Get the default config file path for creating new config files.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

/// Save configuration to a file.
fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}

fn env_key(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key)
}

/// Read and parse `SERIAL_LINK_<key>`, if set.
fn env_parsed<T: FromStr>(key: &str, what: &str) -> ConfigResult<Option<T>> {
    let var = env_key(key);
    match std::env::var(&var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env_parse(var, format!("Invalid {}", what))),
        Err(_) => Ok(None),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(env_key(key))
        .ok()
        .map(|val| matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `SERIAL_LINK_<SECTION>_<KEY>`
/// For example:
/// - `SERIAL_LINK_SERIAL_BAUD_RATE=115200`
/// - `SERIAL_LINK_ENGINE_PIN_POLL_INTERVAL_MS=5`
/// - `SERIAL_LINK_REGISTRY_EXCLUDE_PORTS=/dev/ttyS0,/dev/ttyS1`
/// - `SERIAL_LINK_LOGGING_LEVEL=debug`
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    // Serial overrides
    if let Some(val) = env_parsed("SERIAL_BAUD_RATE", "baud rate")? {
        config.serial.baud_rate = val;
    }
    if let Some(val) = env_parsed("SERIAL_DATA_BITS", "data bits")? {
        config.serial.data_bits = val;
    }
    if let Some(val) = env_parsed("SERIAL_STOP_BITS", "stop bits")? {
        config.serial.stop_bits = val;
    }
    if let Ok(val) = std::env::var(env_key("SERIAL_PARITY")) {
        config.serial.parity = match val.trim().to_lowercase().as_str() {
            "none" => crate::port::Parity::None,
            "odd" => crate::port::Parity::Odd,
            "even" => crate::port::Parity::Even,
            _ => {
                return Err(ConfigError::env_parse(
                    env_key("SERIAL_PARITY"),
                    "Expected none, odd or even",
                ))
            }
        };
    }
    if let Some(val) = env_bool("SERIAL_ALLOW_NON_STANDARD_BAUD") {
        config.serial.allow_non_standard_baud = val;
    }
    if let Some(val) = env_bool("SERIAL_RTS_CTS") {
        config.serial.rts_cts = val;
    }
    if let Some(val) = env_bool("SERIAL_DTR_DSR") {
        config.serial.dtr_dsr = val;
    }
    if let Some(val) = env_bool("SERIAL_DCD_OUTPUT") {
        config.serial.dcd_output = val;
    }
    if let Some(val) = env_bool("SERIAL_ECHO") {
        config.serial.echo = val;
    }

    // Engine overrides
    if let Some(val) = env_parsed("ENGINE_PIN_POLL_INTERVAL_MS", "interval")? {
        config.engine.pin_poll_interval_ms = val;
    }
    if let Some(val) = env_parsed("ENGINE_READ_TIMEOUT_MS", "timeout")? {
        config.engine.read_timeout_ms = val;
    }
    if let Some(val) = env_parsed("ENGINE_READ_CHUNK_SIZE", "chunk size")? {
        config.engine.read_chunk_size = val;
    }

    // Registry overrides
    if let Some(val) = env_parsed("REGISTRY_SCAN_INTERVAL_MS", "interval")? {
        config.registry.scan_interval_ms = val;
    }
    if let Ok(val) = std::env::var(env_key("REGISTRY_EXCLUDE_PORTS")) {
        config.registry.exclude_ports = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    // Logging overrides
    if let Ok(val) = std::env::var(env_key("LOGGING_LEVEL")) {
        config.logging.level = val;
    }
    if let Ok(val) = std::env::var(env_key("LOGGING_FORMAT")) {
        config.logging.format = match val.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => {
                return Err(ConfigError::env_parse(
                    env_key("LOGGING_FORMAT"),
                    "Expected json, pretty or compact",
                ))
            }
        };
    }
    if let Ok(val) = std::env::var(env_key("LOGGING_FILE")) {
        config.logging.file = Some(PathBuf::from(val));
    }

    Ok(())
}
