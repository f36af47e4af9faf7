//! Configuration schema definitions.
//!
//! This module defines the structure of the configuration file using serde.
//! All configuration sections are defined here with appropriate defaults.

use super::error::{ConfigError, ConfigResult};
use crate::port::{DataBits, FlowControlFlags, Parity, PortSettings, StopBits};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default line settings for new ports
    pub serial: SerialConfig,
    /// Port engine tuning
    pub engine: EngineConfig,
    /// Device discovery
    pub registry: RegistryConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Check every section for values the engine cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        self.serial.to_port_settings()?;

        if self.engine.pin_poll_interval_ms == 0 {
            return Err(ConfigError::validation(
                "engine.pin_poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.engine.read_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "engine.read_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.engine.read_chunk_size == 0 {
            return Err(ConfigError::validation(
                "engine.read_chunk_size",
                "must be greater than zero",
            ));
        }
        if self.registry.scan_interval_ms == 0 {
            return Err(ConfigError::validation(
                "registry.scan_interval_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Default line settings applied to ports created by the registry or CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Permit rates outside the standard table
    pub allow_non_standard_baud: bool,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity: "none", "odd" or "even"
    pub parity: Parity,
    /// RTS/CTS flow control
    pub rts_cts: bool,
    /// DTR/DSR flow control
    pub dtr_dsr: bool,
    /// Output gated on DCD
    pub dcd_output: bool,
    /// Driver-level echo
    pub echo: bool,
    /// RTS level on open
    pub rts: bool,
    /// DTR level on open
    pub dtr: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::from(&PortSettings::default())
    }
}

impl SerialConfig {
    /// Convert to engine settings, validating numeric fields on the way.
    pub fn to_port_settings(&self) -> ConfigResult<PortSettings> {
        let data_bits = DataBits::from_count(self.data_bits)
            .ok_or_else(|| ConfigError::validation("serial.data_bits", "must be 5, 6, 7 or 8"))?;
        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            _ => return Err(ConfigError::validation("serial.stop_bits", "must be 1 or 2")),
        };

        let settings = PortSettings {
            baud_rate: self.baud_rate,
            allow_non_standard_baud: self.allow_non_standard_baud,
            data_bits,
            stop_bits,
            parity: self.parity,
            flow_control: FlowControlFlags {
                rts_cts: self.rts_cts,
                dtr_dsr: self.dtr_dsr,
                dcd_output: self.dcd_output,
            },
            echo: self.echo,
            rts: self.rts,
            dtr: self.dtr,
        };
        settings
            .validate()
            .map_err(|source| ConfigError::InvalidSettings {
                key: "serial.baud_rate".to_string(),
                source,
            })?;
        Ok(settings)
    }
}

impl From<&PortSettings> for SerialConfig {
    fn from(settings: &PortSettings) -> Self {
        Self {
            baud_rate: settings.baud_rate,
            allow_non_standard_baud: settings.allow_non_standard_baud,
            data_bits: settings.data_bits.count(),
            stop_bits: match settings.stop_bits {
                StopBits::One => 1,
                StopBits::Two => 2,
            },
            parity: settings.parity,
            rts_cts: settings.flow_control.rts_cts,
            dtr_dsr: settings.flow_control.dtr_dsr,
            dcd_output: settings.flow_control.dcd_output,
            echo: settings.echo,
            rts: settings.rts,
            dtr: settings.dtr,
        }
    }
}

/// Port engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How often CTS/DSR/DCD are sampled
    pub pin_poll_interval_ms: u64,
    /// Upper bound on a single blocking read
    pub read_timeout_ms: u64,
    /// Largest chunk handed over per read
    pub read_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pin_poll_interval_ms: 10,
            read_timeout_ms: 100,
            read_chunk_size: 1024,
        }
    }
}

impl EngineConfig {
    pub fn pin_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pin_poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Device discovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between device scans in the watcher
    pub scan_interval_ms: u64,
    /// Paths never tracked (e.g. Bluetooth modems)
    pub exclude_ports: Vec<String>,
    /// Display names keyed by device path
    pub port_aliases: HashMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 1000,
            exclude_ports: Vec::new(),
            port_aliases: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_ports.iter().any(|p| p == path)
    }

    pub fn alias(&self, path: &str) -> Option<&str> {
        self.port_aliases.get(path).map(String::as_str)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset: "trace", "debug", "info", "warn", "error"
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Log file path (stderr when unset)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format with colors
    #[default]
    Pretty,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.serial.data_bits, 8);
        assert_eq!(config.engine.pin_poll_interval_ms, 10);
        assert_eq!(config.engine.read_chunk_size, 1024);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[serial]
baud_rate = 115200
parity = "even"
rts_cts = true

[registry]
exclude_ports = ["/dev/cu.Bluetooth-Incoming-Port"]

[registry.port_aliases]
"/dev/ttyUSB0" = "GPS"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.serial.baud_rate, 115200);
        assert_eq!(config.serial.parity, Parity::Even);
        assert_eq!(config.engine.read_timeout_ms, 100);
        assert!(config
            .registry
            .is_excluded("/dev/cu.Bluetooth-Incoming-Port"));
        assert_eq!(config.registry.alias("/dev/ttyUSB0"), Some("GPS"));

        let settings = config.serial.to_port_settings().unwrap();
        assert!(settings.flow_control.rts_cts);
        assert_eq!(settings.parity, Parity::Even);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.serial.data_bits = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { ref key, .. }) if key == "serial.data_bits"
        ));

        let mut config = Config::default();
        config.engine.pin_poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.serial.baud_rate = 250_000;
        assert!(config.validate().is_err());
        config.serial.allow_non_standard_baud = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serial_config_round_trips_settings() {
        let settings = PortSettings {
            baud_rate: 57600,
            stop_bits: StopBits::Two,
            dtr: true,
            ..Default::default()
        };
        let config = SerialConfig::from(&settings);
        assert_eq!(config.to_port_settings().unwrap(), settings);
    }
}
