//! Mock serial devices for testing.
//!
//! Provides a `MockSerialPort` that simulates a device without requiring
//! actual hardware, a `MockOpener` the engine can open it through, and a
//! `MockEnumerator` that scripts device arrival and removal for the
//! registry. Every handle shares state with its clones, so a test can keep
//! one copy and drive the device while the engine owns another.

use super::error::PortError;
use super::settings::PortSettings;
use super::traits::{DeviceOpener, PinState, SerialPortAdapter};
use crate::registry::{DeviceEnumerator, DeviceInfo};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inner state of the mock port, protected by a mutex for interior mutability.
#[derive(Debug, Default)]
struct MockPortState {
    /// Queue of bytes to be returned by read operations.
    read_queue: VecDeque<u8>,
    /// Log of all bytes written to the port.
    write_log: Vec<Vec<u8>>,
    /// Canned replies keyed by the exact bytes written.
    responses: Vec<(Vec<u8>, Vec<u8>)>,
    /// Errno returned by the next write, if set.
    fail_next_write: Option<i32>,
    /// Simulates the device being unplugged.
    disconnected: bool,
    /// Errno returned by every status line read, if set.
    fail_pins: Option<i32>,
    /// Input line levels.
    pins: PinState,
    /// Output line levels.
    rts: bool,
    dtr: bool,
    /// Last settings pushed through `apply_settings`.
    applied_settings: Option<PortSettings>,
    /// Number of times `restore` was called.
    restore_count: usize,
    /// Read timeout.
    timeout: Duration,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<MockPortState>,
    readable: Condvar,
}

/// Mock serial port implementation for testing.
///
/// This implementation allows you to:
/// - Enqueue data to be returned by read operations
/// - Inspect what data was written
/// - Register canned responses to specific writes
/// - Drive the modem-status input lines
/// - Simulate write failures and device removal
///
/// # Example
/// ```
/// use serial_link::port::{MockSerialPort, SerialPortAdapter};
///
/// let mut port = MockSerialPort::new("MOCK0");
///
/// // Enqueue data to be read
/// port.enqueue_read(b"Hello, World!");
///
/// // Perform a read
/// let mut buffer = [0u8; 13];
/// let n = port.read_bytes(&mut buffer).unwrap();
/// assert_eq!(&buffer[..n], b"Hello, World!");
///
/// // Write some data
/// port.write_bytes(b"Response").unwrap();
/// assert_eq!(port.get_write_log(), vec![b"Response".to_vec()]);
/// ```
#[derive(Clone)]
pub struct MockSerialPort {
    /// The port name/identifier.
    name: String,
    shared: Arc<Shared>,
}

impl MockSerialPort {
    /// Create a new mock serial port with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(MockPortState {
                    timeout: Duration::from_millis(20),
                    ..Default::default()
                }),
                readable: Condvar::new(),
            }),
        }
    }

    /// Enqueue bytes to be returned by subsequent read operations.
    ///
    /// The bytes are added to the end of the read queue and any blocked
    /// reader is woken.
    pub fn enqueue_read(&self, data: &[u8]) {
        let mut state = self.shared.state.lock();
        state.read_queue.extend(data);
        self.shared.readable.notify_all();
    }

    /// Whenever exactly `request` is written, enqueue `response` for reading.
    pub fn respond_to(&self, request: &[u8], response: &[u8]) {
        let mut state = self.shared.state.lock();
        state
            .responses
            .push((request.to_vec(), response.to_vec()));
    }

    /// Get a copy of all data written to the port.
    pub fn get_write_log(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().write_log.clone()
    }

    /// Clear the write log.
    pub fn clear_write_log(&self) {
        self.shared.state.lock().write_log.clear();
    }

    /// Make the next write fail with the given errno.
    pub fn fail_next_write(&self, errno: i32) {
        self.shared.state.lock().fail_next_write = Some(errno);
    }

    /// Simulate the device being unplugged. Every later operation fails.
    pub fn disconnect(&self) {
        let mut state = self.shared.state.lock();
        state.disconnected = true;
        self.shared.readable.notify_all();
    }

    /// Plug the device back in.
    pub fn reconnect(&self) {
        let mut state = self.shared.state.lock();
        state.disconnected = false;
        state.fail_pins = None;
    }

    /// Make every status line read fail with the given errno while data
    /// reads keep timing out normally, as a tty does right after unplug.
    pub fn fail_pin_reads(&self, errno: i32) {
        self.shared.state.lock().fail_pins = Some(errno);
    }

    /// Set the CTS/DSR/DCD input levels.
    pub fn set_pins(&self, pins: PinState) {
        self.shared.state.lock().pins = pins;
    }

    /// Current RTS output level.
    pub fn rts(&self) -> bool {
        self.shared.state.lock().rts
    }

    /// Current DTR output level.
    pub fn dtr(&self) -> bool {
        self.shared.state.lock().dtr
    }

    /// Settings most recently pushed to the device.
    pub fn applied_settings(&self) -> Option<PortSettings> {
        self.shared.state.lock().applied_settings.clone()
    }

    /// How many times the device was restored to its original attributes.
    pub fn restore_count(&self) -> usize {
        self.shared.state.lock().restore_count
    }

    /// Get the number of bytes available to read.
    pub fn available_bytes(&self) -> usize {
        self.shared.state.lock().read_queue.len()
    }

    fn gone_error() -> PortError {
        PortError::Io(io::Error::new(
            io::ErrorKind::NotConnected,
            "mock device disconnected",
        ))
    }
}

impl SerialPortAdapter for MockSerialPort {
    fn write_bytes(&mut self, data: &[u8]) -> Result<usize, PortError> {
        let mut state = self.shared.state.lock();

        if state.disconnected {
            return Err(Self::gone_error());
        }
        if let Some(errno) = state.fail_next_write.take() {
            return Err(PortError::Io(io::Error::from_raw_os_error(errno)));
        }

        state.write_log.push(data.to_vec());

        let reply = state
            .responses
            .iter()
            .find(|(request, _)| request.as_slice() == data)
            .map(|(_, response)| response.clone());
        if let Some(reply) = reply {
            state.read_queue.extend(reply);
            self.shared.readable.notify_all();
        }

        Ok(data.len())
    }

    fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<usize, PortError> {
        let mut state = self.shared.state.lock();
        let deadline = Instant::now() + state.timeout;

        loop {
            if state.disconnected {
                return Err(Self::gone_error());
            }
            if !state.read_queue.is_empty() {
                break;
            }
            if self
                .shared
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                if state.read_queue.is_empty() && !state.disconnected {
                    return Err(PortError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "No data available",
                    )));
                }
            }
        }

        let n = buffer.len().min(state.read_queue.len());
        for (slot, byte) in buffer.iter_mut().zip(state.read_queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), PortError> {
        self.shared.state.lock().timeout = timeout;
        Ok(())
    }

    fn apply_settings(&mut self, settings: &PortSettings) -> Result<(), PortError> {
        settings.validate()?;
        let mut state = self.shared.state.lock();
        if state.disconnected {
            return Err(Self::gone_error());
        }
        state.applied_settings = Some(settings.clone());
        Ok(())
    }

    fn write_request_to_send(&mut self, level: bool) -> Result<(), PortError> {
        let mut state = self.shared.state.lock();
        if state.disconnected {
            return Err(Self::gone_error());
        }
        state.rts = level;
        Ok(())
    }

    fn write_data_terminal_ready(&mut self, level: bool) -> Result<(), PortError> {
        let mut state = self.shared.state.lock();
        if state.disconnected {
            return Err(Self::gone_error());
        }
        state.dtr = level;
        Ok(())
    }

    fn read_pins(&mut self) -> Result<PinState, PortError> {
        let state = self.shared.state.lock();
        if state.disconnected {
            return Err(Self::gone_error());
        }
        if let Some(errno) = state.fail_pins {
            return Err(PortError::Io(io::Error::from_raw_os_error(errno)));
        }
        Ok(state.pins)
    }

    fn try_clone_adapter(&self) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        Ok(Box::new(self.clone()))
    }

    fn restore(&mut self) -> Result<(), PortError> {
        let mut state = self.shared.state.lock();
        state.restore_count += 1;
        if state.disconnected {
            return Err(Self::gone_error());
        }
        Ok(())
    }
}

impl std::fmt::Debug for MockSerialPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSerialPort")
            .field("name", &self.name)
            .field("available_bytes", &self.available_bytes())
            .finish()
    }
}

#[derive(Debug, Default)]
struct OpenerState {
    devices: HashMap<String, MockSerialPort>,
    failures: HashMap<String, i32>,
    open_counts: HashMap<String, usize>,
}

/// Opens [`MockSerialPort`]s registered by path.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    state: Arc<Mutex<OpenerState>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `port` openable under its own name.
    pub fn add(&self, port: &MockSerialPort) {
        self.state
            .lock()
            .devices
            .insert(port.name.clone(), port.clone());
    }

    /// Make every open of `path` fail with `errno`.
    pub fn fail_open(&self, path: &str, errno: i32) {
        self.state.lock().failures.insert(path.to_string(), errno);
    }

    /// Let `path` open normally again.
    pub fn clear_failure(&self, path: &str) {
        self.state.lock().failures.remove(path);
    }

    /// Number of successful opens of `path`.
    pub fn open_count(&self, path: &str) -> usize {
        self.state
            .lock()
            .open_counts
            .get(path)
            .copied()
            .unwrap_or(0)
    }
}

impl DeviceOpener for MockOpener {
    fn open(
        &self,
        path: &str,
        settings: &PortSettings,
    ) -> Result<Box<dyn SerialPortAdapter>, PortError> {
        let mut state = self.state.lock();
        if let Some(errno) = state.failures.get(path) {
            return Err(PortError::Io(io::Error::from_raw_os_error(*errno)));
        }
        let mut port = state
            .devices
            .get(path)
            .cloned()
            .ok_or_else(|| PortError::not_found(path))?;
        if port.shared.state.lock().disconnected {
            return Err(PortError::not_found(path));
        }
        port.apply_settings(settings)?;
        *state.open_counts.entry(path.to_string()).or_default() += 1;
        Ok(Box::new(port))
    }
}

/// Scripted device list for exercising the registry.
#[derive(Debug, Clone, Default)]
pub struct MockEnumerator {
    devices: Arc<Mutex<Vec<DeviceInfo>>>,
}

impl MockEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the device list.
    pub fn set_devices(&self, devices: Vec<DeviceInfo>) {
        *self.devices.lock() = devices;
    }

    /// Add a device to the list.
    pub fn plug(&self, path: &str, name: &str) {
        let mut devices = self.devices.lock();
        if !devices.iter().any(|d| d.path == path) {
            devices.push(DeviceInfo::new(path, name));
        }
    }

    /// Remove a device from the list.
    pub fn unplug(&self, path: &str) {
        self.devices.lock().retain(|d| d.path != path);
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn devices(&self) -> Result<Vec<DeviceInfo>, PortError> {
        Ok(self.devices.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_and_read() {
        let mut port = MockSerialPort::new("MOCK0");
        port.enqueue_read(b"Hello");

        let mut buffer = [0u8; 10];
        let n = port.read_bytes(&mut buffer).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buffer[..n], b"Hello");
    }

    #[test]
    fn test_write_logging() {
        let mut port = MockSerialPort::new("MOCK0");
        port.write_bytes(b"Test1").unwrap();
        port.write_bytes(b"Test2").unwrap();

        let log = port.get_write_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], b"Test1");
        assert_eq!(log[1], b"Test2");
    }

    #[test]
    fn test_canned_response() {
        let mut port = MockSerialPort::new("MOCK0");
        port.respond_to(b"PING", b"PONG");
        port.write_bytes(b"PING").unwrap();

        let mut buffer = [0u8; 8];
        let n = port.read_bytes(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"PONG");
    }

    #[test]
    fn test_empty_read_times_out() {
        let mut port = MockSerialPort::new("MOCK0");
        port.set_timeout(Duration::from_millis(5)).unwrap();

        let mut buffer = [0u8; 10];
        let err = port.read_bytes(&mut buffer).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_partial_read() {
        let mut port = MockSerialPort::new("MOCK0");
        port.enqueue_read(b"Hello, World!");

        let mut buffer = [0u8; 5];
        let n = port.read_bytes(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"Hello");
        assert_eq!(port.available_bytes(), 8);
    }

    #[test]
    fn test_disconnect_fails_operations() {
        let mut port = MockSerialPort::new("MOCK0");
        port.disconnect();

        let mut buffer = [0u8; 4];
        assert!(port.read_bytes(&mut buffer).unwrap_err().is_device_gone());
        assert!(port.write_bytes(b"x").unwrap_err().is_device_gone());
        assert!(port.read_pins().unwrap_err().is_device_gone());
    }

    #[test]
    fn test_injected_write_failure() {
        let mut port = MockSerialPort::new("MOCK0");
        port.fail_next_write(5);

        let err = port.write_bytes(b"x").unwrap_err();
        assert_eq!(err.report("MOCK0").code, 5);
        assert!(port.write_bytes(b"x").is_ok());
    }

    #[test]
    fn test_clone_shares_state() {
        let port = MockSerialPort::new("MOCK0");
        let mut clone = port.try_clone_adapter().unwrap();
        clone.write_request_to_send(true).unwrap();
        assert!(port.rts());
    }

    #[test]
    fn test_opener() {
        let opener = MockOpener::new();
        let port = MockSerialPort::new("MOCK0");
        opener.add(&port);

        assert!(opener.open("MOCK0", &PortSettings::default()).is_ok());
        assert_eq!(opener.open_count("MOCK0"), 1);
        assert!(port.applied_settings().is_some());

        assert!(matches!(
            opener.open("MOCK1", &PortSettings::default()),
            Err(PortError::NotFound(_))
        ));

        opener.fail_open("MOCK0", 16);
        let err = opener.open("MOCK0", &PortSettings::default()).unwrap_err();
        assert_eq!(err.report("MOCK0").code, 16);
    }

    #[test]
    fn test_enumerator() {
        let enumerator = MockEnumerator::new();
        enumerator.plug("/dev/ttyA", "A");
        enumerator.plug("/dev/ttyA", "A");
        enumerator.plug("/dev/ttyB", "B");
        assert_eq!(enumerator.devices().unwrap().len(), 2);

        enumerator.unplug("/dev/ttyA");
        let devices = enumerator.devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].path, "/dev/ttyB");
    }
}
