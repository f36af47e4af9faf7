//! Synchronous serial port implementation.
//!
//! Wraps the `serialport` crate's `SerialPort` trait with our own `SerialPortAdapter`
//! trait. On Unix the original `termios` of the device is captured before
//! the backend touches it so [`SerialPortAdapter::restore`] can put the line
//! back on close.

use super::error::PortError;
use super::settings::PortSettings;
use super::traits::{DeviceOpener, PinState, SerialPortAdapter};
use std::io::{Read, Write};
use std::time::Duration;

#[cfg(unix)]
use super::settings::termios;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Synchronous serial port implementation wrapping `serialport::SerialPort`.
pub struct SyncSerialPort {
    /// The underlying serial port implementation.
    port: Box<dyn serialport::SerialPort>,
    /// The port name/path for identification.
    name: String,
    /// Descriptor for direct `termios` access. `None` on cloned handles.
    #[cfg(unix)]
    fd: Option<RawFd>,
    /// Attributes the device had before we opened it.
    #[cfg(unix)]
    original: Option<libc::termios>,
    /// Private duplicate of the descriptor, held by clones for `TIOCMGET`.
    #[cfg(unix)]
    status: Option<OwnedFd>,
}

impl SyncSerialPort {
    /// Open a serial port with the given settings.
    ///
    /// # Example
    /// ```no_run
    /// use serial_link::port::{PortSettings, SyncSerialPort};
    ///
    /// let port = SyncSerialPort::open("/dev/ttyUSB0", &PortSettings::default())?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open(port_name: &str, settings: &PortSettings) -> Result<Self, PortError> {
        settings.validate()?;

        #[cfg(unix)]
        {
            let original = snapshot_termios(port_name)?;
            let native = settings
                .builder(port_name)
                .open_native()
                .map_err(|e| map_open_error(port_name, e))?;
            let fd = native.as_raw_fd();

            let mut port = Self {
                port: Box::new(native),
                name: port_name.to_string(),
                fd: Some(fd),
                original,
                status: None,
            };
            port.apply_settings(settings)?;
            Ok(port)
        }

        #[cfg(not(unix))]
        {
            let port = settings
                .builder(port_name)
                .open()
                .map_err(|e| map_open_error(port_name, e))?;
            Ok(Self {
                port,
                name: port_name.to_string(),
            })
        }
    }

    /// Get a reference to the underlying serialport implementation.
    pub fn as_raw(&self) -> &dyn serialport::SerialPort {
        &*self.port
    }

    #[cfg(unix)]
    fn apply_termios(&mut self, settings: &PortSettings) -> Result<(), PortError> {
        let Some(fd) = self.fd else {
            return Ok(());
        };
        let mut attrs = termios::zeroed();
        // SAFETY: fd belongs to the open port and attrs is a valid termios.
        if unsafe { libc::tcgetattr(fd, &mut attrs) } != 0 {
            return Err(PortError::Io(std::io::Error::last_os_error()));
        }
        termios::apply(settings, &mut attrs);
        // SAFETY: as above.
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &attrs) } != 0 {
            return Err(PortError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn status_fd(&self) -> Option<RawFd> {
        self.fd
            .or_else(|| self.status.as_ref().map(|fd| fd.as_raw_fd()))
    }

    /// Modem status through `TIOCMGET`, keeping the errno on failure.
    #[cfg(unix)]
    fn read_status_bits(fd: RawFd) -> Result<PinState, PortError> {
        let mut bits: libc::c_int = 0;
        // SAFETY: fd is open while self is alive and bits is a valid out-pointer.
        if unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut bits as *mut libc::c_int) } != 0 {
            return Err(PortError::Io(std::io::Error::last_os_error()));
        }
        Ok(PinState {
            cts: bits & libc::TIOCM_CTS != 0,
            dsr: bits & libc::TIOCM_DSR != 0,
            dcd: bits & libc::TIOCM_CAR != 0,
        })
    }
}

fn map_open_error(port_name: &str, e: serialport::Error) -> PortError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => PortError::not_found(port_name),
        serialport::ErrorKind::InvalidInput => PortError::config(e.to_string()),
        _ => PortError::Serial(e),
    }
}

/// Read the device's current attributes without taking it over.
///
/// Open failures are surfaced with their errno so callers see `EBUSY`,
/// `EACCES` and friends. A path that is not a tty yields `None` and the
/// backend open decides what happens next.
#[cfg(unix)]
fn snapshot_termios(port_name: &str) -> Result<Option<libc::termios>, PortError> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(port_name)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PortError::not_found(port_name),
            _ => PortError::Io(e),
        })?;

    let mut attrs = termios::zeroed();
    // SAFETY: file is open for the duration of the call.
    let rc = unsafe { libc::tcgetattr(file.as_raw_fd(), &mut attrs) };
    Ok((rc == 0).then_some(attrs))
}

impl SerialPortAdapter for SyncSerialPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        self.port.write(data).map_err(PortError::Io)
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError> {
        self.port.read(buffer).map_err(PortError::Io)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError> {
        self.port.set_timeout(timeout).map_err(PortError::Serial)
    }

    fn apply_settings(&mut self, settings: &PortSettings) -> Result<(), PortError> {
        settings.validate()?;
        self.port.set_data_bits(settings.data_bits.into())?;
        self.port.set_parity(settings.parity.into())?;
        self.port.set_stop_bits(settings.stop_bits.into())?;
        self.port.set_flow_control(settings.flow_control.into())?;

        #[cfg(unix)]
        self.apply_termios(settings)?;

        // Custom rates go through the backend's platform-specific speed ioctl.
        if !super::settings::is_standard_baud(settings.baud_rate) || cfg!(not(unix)) {
            self.port.set_baud_rate(settings.baud_rate)?;
        }
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), PortError> {
        self.port
            .write_request_to_send(level)
            .map_err(PortError::Serial)
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), PortError> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(PortError::Serial)
    }

    fn read_pins(&mut self) -> Result<PinState, PortError> {
        #[cfg(unix)]
        {
            if let Some(fd) = self.status_fd() {
                return Self::read_status_bits(fd);
            }
        }
        Ok(PinState {
            cts: self.port.read_clear_to_send()?,
            dsr: self.port.read_data_set_ready()?,
            dcd: self.port.read_carrier_detect()?,
        })
    }

    fn try_clone_adapter(&self) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        let port = self.port.try_clone()?;
        #[cfg(unix)]
        let status = match self.status_fd() {
            // SAFETY: the descriptor stays open for the duration of the borrow.
            Some(fd) => Some(unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?),
            None => None,
        };
        Ok(Box::new(SyncSerialPort {
            port,
            name: self.name.clone(),
            #[cfg(unix)]
            fd: None,
            #[cfg(unix)]
            original: None,
            #[cfg(unix)]
            status,
        }))
    }

    #[cfg(unix)]
    fn restore(&mut self) -> Result<(), PortError> {
        let (Some(fd), Some(original)) = (self.fd, self.original.take()) else {
            return Ok(());
        };

        // Drop flow control first so draining cannot block on a deasserted CTS.
        let mut current = termios::zeroed();
        // SAFETY: fd belongs to the open port; both structs are valid.
        unsafe {
            if libc::tcgetattr(fd, &mut current) == 0 {
                termios::disable_flow_control(&mut current);
                libc::tcsetattr(fd, libc::TCSANOW, &current);
            }
            if libc::tcsetattr(fd, libc::TCSADRAIN, &original) != 0 {
                return Err(PortError::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SyncSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSerialPort")
            .field("name", &self.name)
            .field("baud_rate", &self.port.baud_rate())
            .finish()
    }
}

/// Opens real devices through the `serialport` backend.
#[derive(Debug, Clone)]
pub struct SystemOpener {
    read_timeout: Duration,
}

impl SystemOpener {
    /// `read_timeout` bounds each blocking read so the reader thread can
    /// notice a stop request.
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SystemOpener {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl DeviceOpener for SystemOpener {
    fn open(
        &self,
        path: &str,
        settings: &PortSettings,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        let mut port = SyncSerialPort::open(path, settings)?;
        port.set_timeout(self.read_timeout)?;
        Ok(Box::new(port))
    }
}
