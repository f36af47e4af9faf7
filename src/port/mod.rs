//! Port abstraction layer for serial communication.
//!
//! Provides the line-discipline settings, the device traits the engine is
//! written against, the `serialport`-backed implementation and mocks for
//! testing.

pub mod error;
pub mod mock;
pub mod settings;
pub mod sync_port;
pub mod traits;

pub use error::PortError;
pub use mock::{MockEnumerator, MockOpener, MockSerialPort};
pub use settings::{
    is_standard_baud, DataBits, FlowControlFlags, Parity, PortSettings, StopBits,
    STANDARD_BAUD_RATES,
};
pub use sync_port::{SyncSerialPort, SystemOpener};
pub use traits::{DeviceOpener, PinState, SerialPortAdapter};
