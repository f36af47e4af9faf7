//! Core traits for serial port abstraction.
//!
//! Defines the `SerialPortAdapter` trait that allows both real serial ports
//! and mock implementations to be driven by the port engine, plus the
//! `DeviceOpener` seam the engine opens devices through.

use super::error::PortError;
use super::settings::PortSettings;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;

/// Levels of the modem-status input lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PinState {
    /// Clear To Send.
    pub cts: bool,
    /// Data Set Ready.
    pub dsr: bool,
    /// Data Carrier Detect.
    pub dcd: bool,
}

impl PinState {
    const CTS: u8 = 0b001;
    const DSR: u8 = 0b010;
    const DCD: u8 = 0b100;

    /// Pack into a bitmask suitable for an atomic.
    pub fn to_bits(self) -> u8 {
        let mut bits = 0;
        if self.cts {
            bits |= Self::CTS;
        }
        if self.dsr {
            bits |= Self::DSR;
        }
        if self.dcd {
            bits |= Self::DCD;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            cts: bits & Self::CTS != 0,
            dsr: bits & Self::DSR != 0,
            dcd: bits & Self::DCD != 0,
        }
    }
}

/// Trait for serial port I/O operations.
///
/// This trait abstracts over synchronous serial port operations, allowing both
/// real hardware ports and mock implementations for testing. The engine owns
/// one instance per open port and hands clones to its reader and pin-poller
/// threads via [`SerialPortAdapter::try_clone_adapter`].
pub trait SerialPortAdapter: Send + std::fmt::Debug {
    /// Write bytes to the serial port.
    ///
    /// Returns the number of bytes actually written.
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError>;

    /// Read bytes from the serial port into the provided buffer.
    ///
    /// Returns the number of bytes actually read. A read that finds no data
    /// within the timeout returns an error for which
    /// [`PortError::is_timeout`] is true.
    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError>;

    /// Get the name/path of this serial port.
    fn name(&self) -> &str;

    /// Set the read timeout for this port.
    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError>;

    /// Push new line settings to the device.
    fn apply_settings(&mut self, settings: &PortSettings) -> Result<(), PortError>;

    /// Drive the RTS output line.
    fn write_request_to_send(&mut self, level: bool) -> Result<(), PortError>;

    /// Drive the DTR output line.
    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), PortError>;

    /// Sample the CTS, DSR and DCD input lines.
    fn read_pins(&mut self) -> Result<PinState, PortError>;

    /// Open a second handle onto the same device.
    fn try_clone_adapter(&self) -> Result<Box<dyn SerialPortAdapter>, PortError>;

    /// Put the device back the way it was found before it was opened.
    fn restore(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    /// Write the whole buffer, retrying short writes.
    fn write_all_bytes(&mut self, mut data: &[u8]) -> Result<(), PortError> {
        while !data.is_empty() {
            match self.write_bytes(data)? {
                0 => {
                    return Err(PortError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "serial device accepted no bytes",
                    )))
                }
                n => data = &data[n..],
            }
        }
        Ok(())
    }
}

/// Opens devices by path. The engine owns one of these so tests can swap in
/// scripted devices.
pub trait DeviceOpener: Send + Sync + std::fmt::Debug {
    fn open(
        &self,
        path: &str,
        settings: &PortSettings,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError>;
}
