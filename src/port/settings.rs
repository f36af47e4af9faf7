//! Line discipline: semantic port settings and their OS representations.
//!
//! [`PortSettings`] is what callers configure. It converts to the
//! `serialport` builder enums on every platform and, on Unix, to and from a
//! raw `termios` structure so flags the backend does not expose (echo,
//! DTR/DSR and DCD flow control) still reach the driver.

use super::error::PortError;
use serde::{Deserialize, Serialize};

/// Baud rates every supported OS accepts without a custom-speed ioctl.
pub const STANDARD_BAUD_RATES: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400,
];

/// Whether `rate` is one of [`STANDARD_BAUD_RATES`].
pub fn is_standard_baud(rate: u32) -> bool {
    STANDARD_BAUD_RATES.contains(&rate)
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

impl DataBits {
    /// Parse a numeric bit count (5 through 8).
    pub fn from_count(bits: u8) -> Option<Self> {
        match bits {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    pub fn count(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Parity checking modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl From<Parity> for serialport::Parity {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    One,
    Two,
}

impl From<StopBits> for serialport::StopBits {
    fn from(bits: StopBits) -> Self {
        match bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

/// Independent hardware flow-control toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlFlags {
    /// RTS/CTS handshaking.
    pub rts_cts: bool,
    /// DTR/DSR handshaking. Only honoured where the OS defines the flags.
    pub dtr_dsr: bool,
    /// Output gated on carrier detect. Only honoured where the OS defines the flag.
    pub dcd_output: bool,
}

impl FlowControlFlags {
    pub fn any(&self) -> bool {
        self.rts_cts || self.dtr_dsr || self.dcd_output
    }
}

impl From<FlowControlFlags> for serialport::FlowControl {
    fn from(flags: FlowControlFlags) -> Self {
        if flags.rts_cts {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        }
    }
}

/// Configuration for a serial port line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Baud rate (bits per second).
    pub baud_rate: u32,

    /// Permit rates outside [`STANDARD_BAUD_RATES`].
    pub allow_non_standard_baud: bool,

    /// Number of data bits.
    pub data_bits: DataBits,

    /// Number of stop bits.
    pub stop_bits: StopBits,

    /// Parity checking mode.
    pub parity: Parity,

    /// Flow control toggles.
    pub flow_control: FlowControlFlags,

    /// Have the driver echo received characters back.
    pub echo: bool,

    /// Desired RTS output level, applied on open.
    pub rts: bool,

    /// Desired DTR output level, applied on open.
    pub dtr: bool,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            allow_non_standard_baud: false,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControlFlags::default(),
            echo: false,
            rts: false,
            dtr: false,
        }
    }
}

impl PortSettings {
    /// Check the settings can be applied to a device.
    pub fn validate(&self) -> Result<(), PortError> {
        if self.baud_rate == 0 {
            return Err(PortError::config("Baud rate must be greater than zero"));
        }
        if !self.allow_non_standard_baud && !is_standard_baud(self.baud_rate) {
            return Err(PortError::config(format!(
                "Non-standard baud rate {} requires allow_non_standard_baud",
                self.baud_rate
            )));
        }
        Ok(())
    }

    /// Start a `serialport` builder carrying these settings.
    pub fn builder(&self, path: &str) -> serialport::SerialPortBuilder {
        serialport::new(path, self.baud_rate)
            .data_bits(self.data_bits.into())
            .parity(self.parity.into())
            .stop_bits(self.stop_bits.into())
            .flow_control(self.flow_control.into())
    }
}

/// Conversions between [`PortSettings`] and the Unix `termios` structure.
///
/// These functions only touch the struct in memory; reading and writing the
/// device attributes is the caller's job.
#[cfg(unix)]
pub mod termios {
    use super::{is_standard_baud, DataBits, FlowControlFlags, Parity, PortSettings, StopBits};

    const SPEEDS: &[(u32, libc::speed_t)] = &[
        (50, libc::B50),
        (75, libc::B75),
        (110, libc::B110),
        (134, libc::B134),
        (150, libc::B150),
        (200, libc::B200),
        (300, libc::B300),
        (600, libc::B600),
        (1200, libc::B1200),
        (1800, libc::B1800),
        (2400, libc::B2400),
        (4800, libc::B4800),
        (9600, libc::B9600),
        (19200, libc::B19200),
        (38400, libc::B38400),
        (57600, libc::B57600),
        (115200, libc::B115200),
        (230400, libc::B230400),
    ];

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const RTS_CTS_FLAGS: libc::tcflag_t = libc::CCTS_OFLOW | libc::CRTS_IFLOW;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    const RTS_CTS_FLAGS: libc::tcflag_t = libc::CRTSCTS;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const DTR_DSR_FLAGS: libc::tcflag_t = libc::CDTR_IFLOW | libc::CDSR_OFLOW;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    const DTR_DSR_FLAGS: libc::tcflag_t = 0;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    const DCD_OUTPUT_FLAGS: libc::tcflag_t = libc::CCAR_OFLOW;
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    const DCD_OUTPUT_FLAGS: libc::tcflag_t = 0;

    /// An all-zero `termios`, the starting point before `tcgetattr`.
    pub fn zeroed() -> libc::termios {
        // SAFETY: termios is a plain C struct of integers and arrays; all-zero is valid.
        unsafe { std::mem::zeroed() }
    }

    /// Map a standard baud rate to its `speed_t` constant.
    pub fn speed_for(rate: u32) -> Option<libc::speed_t> {
        SPEEDS
            .iter()
            .find(|(candidate, _)| *candidate == rate)
            .map(|(_, speed)| *speed)
    }

    fn rate_for(speed: libc::speed_t) -> Option<u32> {
        SPEEDS
            .iter()
            .find(|(_, candidate)| *candidate == speed)
            .map(|(rate, _)| *rate)
    }

    /// Write `settings` into `attrs`.
    ///
    /// Puts the line in raw mode with VMIN=1/VTIME=2, enables the receiver and
    /// local mode, and sets hang-up on close. Returns `false` when the baud
    /// rate has no `speed_t` constant; the speed fields are then left alone and
    /// the caller must set the rate through the custom-speed path.
    pub fn apply(settings: &PortSettings, attrs: &mut libc::termios) -> bool {
        // SAFETY: attrs is a valid, exclusively borrowed termios.
        unsafe { libc::cfmakeraw(attrs) };
        attrs.c_cc[libc::VMIN] = 1;
        attrs.c_cc[libc::VTIME] = 2;

        attrs.c_cflag &= !libc::CSIZE;
        attrs.c_cflag |= match settings.data_bits {
            DataBits::Five => libc::CS5,
            DataBits::Six => libc::CS6,
            DataBits::Seven => libc::CS7,
            DataBits::Eight => libc::CS8,
        };

        match settings.stop_bits {
            StopBits::One => attrs.c_cflag &= !libc::CSTOPB,
            StopBits::Two => attrs.c_cflag |= libc::CSTOPB,
        }

        match settings.parity {
            Parity::None => attrs.c_cflag &= !(libc::PARENB | libc::PARODD),
            Parity::Even => {
                attrs.c_cflag |= libc::PARENB;
                attrs.c_cflag &= !libc::PARODD;
            }
            Parity::Odd => attrs.c_cflag |= libc::PARENB | libc::PARODD,
        }

        set_flow_control(attrs, settings.flow_control);

        attrs.c_cflag |= libc::HUPCL | libc::CLOCAL | libc::CREAD;
        attrs.c_lflag &= !(libc::ICANON | libc::ISIG);
        if settings.echo {
            attrs.c_lflag |= libc::ECHO;
        } else {
            attrs.c_lflag &= !libc::ECHO;
        }

        match speed_for(settings.baud_rate) {
            Some(speed) => {
                // SAFETY: attrs is valid and speed comes from the libc constant table.
                unsafe {
                    libc::cfsetispeed(attrs, speed);
                    libc::cfsetospeed(attrs, speed);
                }
                true
            }
            None => false,
        }
    }

    /// Turn every flow-control flag off. Used before restoring the original
    /// attributes so a drain cannot stall on a deasserted CTS.
    pub fn disable_flow_control(attrs: &mut libc::termios) {
        set_flow_control(attrs, FlowControlFlags::default());
    }

    fn set_flow_control(attrs: &mut libc::termios, flags: FlowControlFlags) {
        for (enabled, mask) in [
            (flags.rts_cts, RTS_CTS_FLAGS),
            (flags.dtr_dsr, DTR_DSR_FLAGS),
            (flags.dcd_output, DCD_OUTPUT_FLAGS),
        ] {
            if enabled {
                attrs.c_cflag |= mask;
            } else {
                attrs.c_cflag &= !mask;
            }
        }
    }

    /// Read the semantic settings back out of `attrs`.
    ///
    /// RTS/DTR output levels are not part of `termios` and come back as
    /// `false`.
    pub fn read(attrs: &libc::termios) -> PortSettings {
        let data_bits = match attrs.c_cflag & libc::CSIZE {
            x if x == libc::CS5 => DataBits::Five,
            x if x == libc::CS6 => DataBits::Six,
            x if x == libc::CS7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = if attrs.c_cflag & libc::CSTOPB != 0 {
            StopBits::Two
        } else {
            StopBits::One
        };
        let parity = if attrs.c_cflag & libc::PARENB == 0 {
            Parity::None
        } else if attrs.c_cflag & libc::PARODD == 0 {
            Parity::Even
        } else {
            Parity::Odd
        };
        let flow_control = FlowControlFlags {
            rts_cts: attrs.c_cflag & RTS_CTS_FLAGS != 0,
            dtr_dsr: DTR_DSR_FLAGS != 0 && attrs.c_cflag & DTR_DSR_FLAGS != 0,
            dcd_output: DCD_OUTPUT_FLAGS != 0 && attrs.c_cflag & DCD_OUTPUT_FLAGS != 0,
        };

        // SAFETY: attrs is a valid termios.
        let speed = unsafe { libc::cfgetospeed(attrs) };
        // BSD-derived systems store the numeric rate directly in speed_t.
        let baud_rate = rate_for(speed).unwrap_or(speed as u32);

        PortSettings {
            baud_rate,
            allow_non_standard_baud: !is_standard_baud(baud_rate),
            data_bits,
            stop_bits,
            parity,
            flow_control,
            echo: attrs.c_lflag & libc::ECHO != 0,
            rts: false,
            dtr: false,
        }
    }
}
