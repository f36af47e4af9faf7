//! Port-specific error types.
//!
//! Defines error types for device-level operations, separate from the
//! protocol-level [`crate::error::RequestError`] so the engine can tell an OS
//! failure apart from a request that simply went unanswered.

use crate::error::{ErrorReport, BACKEND_DOMAIN, ENGINE_DOMAIN, POSIX_DOMAIN};
use std::io;
use thiserror::Error;

/// Errors that can occur during serial port operations.
#[derive(Debug, Error)]
pub enum PortError {
    /// The specified serial port was not found on the system.
    #[error("Serial port not found: {0}")]
    NotFound(String),

    /// An I/O error occurred during port operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Port configuration failed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Attempted to use a port that's not open.
    #[error("Port is not open")]
    NotOpen,

    /// The device was removed from the system; the port cannot be reopened.
    #[error("Port was removed from the system")]
    Removed,

    /// The port's worker thread is gone.
    #[error("Port engine has shut down")]
    EngineStopped,

    /// A serialport-specific error occurred.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl PortError {
    /// Create a NotFound error from a port name.
    pub fn not_found(port_name: impl Into<String>) -> Self {
        Self::NotFound(port_name.into())
    }

    /// Create a Config error from a message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a Timeout error from a duration.
    pub fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout(duration)
    }

    /// True for read timeouts, which the reader treats as "no data yet".
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            Self::Serial(e) => matches!(
                e.kind(),
                serialport::ErrorKind::Io(io::ErrorKind::TimedOut)
            ),
            _ => false,
        }
    }

    /// True when the failure means the device itself has gone away.
    pub fn is_device_gone(&self) -> bool {
        match self {
            Self::Removed => true,
            Self::Io(e) => {
                if e.raw_os_error().is_some_and(is_gone_errno) {
                    return true;
                }
                matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::UnexpectedEof
                )
            }
            Self::Serial(e) => matches!(e.kind(), serialport::ErrorKind::NoDevice),
            _ => false,
        }
    }

    /// Like [`is_device_gone`](Self::is_device_gone), for a failed read of the
    /// modem status lines. An unplugged USB tty fails `TIOCMGET` with EIO,
    /// which a data read can also return transiently, so only the status
    /// poller treats it as removal.
    pub fn is_status_read_gone(&self) -> bool {
        if self.is_device_gone() {
            return true;
        }
        match self {
            Self::Io(e) => e.raw_os_error().is_some_and(is_eio),
            _ => false,
        }
    }

    /// Flatten into the POSIX-style payload delivered to observers.
    pub fn report(&self, path: &str) -> ErrorReport {
        let message = self.to_string();
        match self {
            Self::Io(e) => match e.raw_os_error() {
                Some(code) => ErrorReport::new(POSIX_DOMAIN, code, e.to_string(), path),
                None => ErrorReport::new(ENGINE_DOMAIN, 5, message, path),
            },
            // ENOENT is 2 on every platform we target.
            Self::NotFound(_) => ErrorReport::new(POSIX_DOMAIN, 2, message, path),
            Self::Config(_) => ErrorReport::new(ENGINE_DOMAIN, 1, message, path),
            Self::Timeout(_) => ErrorReport::new(ENGINE_DOMAIN, 2, message, path),
            Self::NotOpen => ErrorReport::new(ENGINE_DOMAIN, 3, message, path),
            Self::Removed => ErrorReport::new(ENGINE_DOMAIN, 4, message, path),
            Self::EngineStopped => ErrorReport::new(ENGINE_DOMAIN, 6, message, path),
            Self::Serial(e) => {
                let code = match e.kind() {
                    serialport::ErrorKind::NoDevice => 1,
                    serialport::ErrorKind::InvalidInput => 2,
                    serialport::ErrorKind::Unknown => 3,
                    serialport::ErrorKind::Io(_) => 4,
                };
                ErrorReport::new(BACKEND_DOMAIN, code, e.description.clone(), path)
            }
        }
    }
}

/// Errno values the kernel returns once a tty has been unplugged.
fn is_gone_errno(code: i32) -> bool {
    #[cfg(unix)]
    {
        code == libc::ENXIO || code == libc::ENODEV
    }

    #[cfg(not(unix))]
    {
        let _ = code;
        false
    }
}

fn is_eio(code: i32) -> bool {
    #[cfg(unix)]
    {
        code == libc::EIO
    }

    #[cfg(not(unix))]
    {
        let _ = code;
        false
    }
}
