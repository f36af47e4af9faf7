//! Protocol-level errors and the error payload handed to observers.
//!
//! OS-level failures live in [`crate::port::PortError`]; before they cross a
//! thread boundary they are flattened into an [`ErrorReport`] so events stay
//! `Clone` and carry the device path with them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error domain used for failures that carry a raw OS errno.
pub const POSIX_DOMAIN: &str = "POSIX";

/// Error domain used for failures reported by the `serialport` backend.
pub const BACKEND_DOMAIN: &str = "serialport";

/// Error domain used for failures raised by this crate itself.
pub const ENGINE_DOMAIN: &str = "serial_link";

/// POSIX-style description of a failure on a specific device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Error domain (`POSIX`, `serialport` or `serial_link`).
    pub domain: String,
    /// Numeric code within the domain. For `POSIX` this is the errno.
    pub code: i32,
    /// Human readable message.
    pub message: String,
    /// Path of the device the failure happened on.
    pub path: String,
}

impl ErrorReport {
    pub fn new(
        domain: impl Into<String>,
        code: i32,
        message: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            code,
            message: message.into(),
            path: path.into(),
        }
    }

    /// Whether this report carries an OS errno.
    pub fn is_posix(&self) -> bool {
        self.domain == POSIX_DOMAIN
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} error {}): {}",
            self.path, self.domain, self.code, self.message
        )
    }
}

/// Why a request did not produce a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// No matching response arrived before the request's timeout.
    #[error("Request timed out")]
    TimedOut,

    /// The port was closed while the request was queued or pending.
    #[error("Port was closed before the request completed")]
    PortClosed,

    /// The device disappeared while the request was queued or pending.
    #[error("Port was removed from the system")]
    PortRemoved,

    /// The request was withdrawn from the queue before it was sent.
    #[error("Request was cancelled before it was sent")]
    Cancelled,

    /// Sending the request failed at the OS level.
    #[error("Port error: {0}")]
    Port(ErrorReport),
}
