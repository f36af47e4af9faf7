//! Serial Link Library
//!
//! Serial port access with packet framing, a one-at-a-time request/response
//! queue and device hot-plug tracking.
//!
//! # Modules
//!
//! - `config`: Configuration management with TOML support
//! - `error`: Error reports and request failures
//! - `framing`: Packet descriptors and the rolling buffers they match against
//! - `request`: Requests and the handles that await their responses
//! - `port`: Line settings and the device layer (system and mock)
//! - `engine`: The per-port worker, its I/O threads and observer events
//! - `registry`: Device discovery and the set of known ports
//! - `logging`: Tracing subscriber setup for binaries
//!
//! # Example
//! ```
//! use serial_link::{EventDispatcher, PacketDescriptor, Port, Request};
//! use serial_link::port::{MockOpener, MockSerialPort};
//! use std::time::Duration;
//!
//! let device = MockSerialPort::new("MOCK0");
//! device.respond_to(b"$TEMP?;", b"!TEMP72;");
//! let opener = MockOpener::new();
//! opener.add(&device);
//!
//! let port = Port::builder("MOCK0")
//!     .opener(opener)
//!     .events(EventDispatcher::disabled())
//!     .build()
//!     .unwrap();
//! port.open().unwrap();
//!
//! let response = PacketDescriptor::delimited_str("!TEMP", ";", 16).unwrap();
//! let request = Request::new(b"$TEMP?;".to_vec())
//!     .with_response(response)
//!     .with_timeout(Duration::from_secs(1));
//! let reply = port.send_request_sync(request).unwrap();
//! assert_eq!(reply.as_deref(), Some(&b"!TEMP72;"[..]));
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod logging;
pub mod port;
pub mod registry;
pub mod request;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError, ConfigLoader};
pub use engine::{
    EventDispatcher, EventReceiver, Port, PortBuilder, PortEvent, PortObserver, PortState,
};
pub use error::{ErrorReport, RequestError};
pub use framing::{DescriptorError, FramingBuffer, PacketDescriptor, PacketMatcher};
pub use logging::init_logging;
pub use port::{
    DataBits, FlowControlFlags, Parity, PinState, PortError, PortSettings, StopBits,
};
pub use registry::{DeviceEnumerator, DeviceInfo, PortRegistry, RegistryEvent, SystemEnumerator};
pub use request::{Request, RequestResult, ResponseHandle};
