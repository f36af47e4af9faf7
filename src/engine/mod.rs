//! The port engine: one [`Port`] per serial device.
//!
//! A `Port` is a thin handle. Device I/O, packet framing and the request
//! queue live on a dedicated worker thread (see [`worker`]); while the port
//! is open a reader thread and a modem-status poller feed that worker.
//! Observers hear about everything through the port's [`EventDispatcher`].

pub mod events;
mod io_threads;
mod worker;

use crate::config::EngineConfig;
use crate::error::RequestError;
use crate::framing::PacketDescriptor;
use crate::port::{
    DeviceOpener, PinState, PortError, PortSettings, SerialPortAdapter, SystemOpener,
};
use crate::request::{Completion, Request, RequestResult, ResponseHandle};
use io_threads::{IoConfig, IoThreads};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use worker::{Command, DetachReason, OutputLine, Queued, Snapshot, Worker};

pub use events::{EventDispatcher, EventReceiver, PortEvent, PortObserver};

/// Lifecycle of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PortState {
    Closed = 0,
    Opening = 1,
    Open = 2,
    Closing = 3,
    /// The device left the system. Terminal.
    Removed = 4,
}

impl PortState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Opening,
            2 => Self::Open,
            3 => Self::Closing,
            4 => Self::Removed,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// State readable from any thread without going through the worker.
#[derive(Debug)]
pub(crate) struct Shared {
    state: AtomicU8,
    pins: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PortState::Closed as u8),
            pins: AtomicU8::new(0),
        }
    }

    pub(crate) fn state(&self) -> PortState {
        PortState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: PortState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn pins(&self) -> PinState {
        PinState::from_bits(self.pins.load(Ordering::SeqCst))
    }

    pub(crate) fn set_pins(&self, pins: PinState) {
        self.pins.store(pins.to_bits(), Ordering::SeqCst);
    }
}

/// Configures and creates a [`Port`].
pub struct PortBuilder {
    path: String,
    name: Option<String>,
    settings: PortSettings,
    engine: EngineConfig,
    opener: Option<Arc<dyn DeviceOpener>>,
    events: EventDispatcher,
}

impl PortBuilder {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: None,
            settings: PortSettings::default(),
            engine: EngineConfig::default(),
            opener: None,
            events: EventDispatcher::disabled(),
        }
    }

    /// Display name. Defaults to the last component of the path.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn settings(mut self, settings: PortSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Open devices through `opener` instead of the `serialport` backend.
    pub fn opener(self, opener: impl DeviceOpener + 'static) -> Self {
        self.shared_opener(Arc::new(opener))
    }

    pub fn shared_opener(mut self, opener: Arc<dyn DeviceOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Create the port and start its worker. The device is not opened.
    pub fn build(self) -> Result<Port, PortError> {
        let name = self
            .name
            .unwrap_or_else(|| default_display_name(&self.path));
        let opener = match self.opener {
            Some(opener) => opener,
            None => Arc::new(SystemOpener::new(self.engine.read_timeout())) as Arc<dyn DeviceOpener>,
        };
        let shared = Arc::new(Shared::new());
        let (commands, receiver) = mpsc::channel();

        let worker = Worker::new(self.path.clone(), shared.clone(), self.events.clone());
        let handle = thread::Builder::new()
            .name(format!("serial-port {}", self.path))
            .spawn(move || worker.run(receiver))?;

        Ok(Port {
            path: self.path,
            name,
            opener,
            events: self.events,
            engine: self.engine,
            settings: Mutex::new(self.settings),
            shared,
            commands,
            worker: Mutex::new(Some(handle)),
            io: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }
}

/// Last path component, which is what users recognise a device by.
pub(crate) fn default_display_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .find(|s| !s.is_empty())
        .unwrap_or(path)
        .to_string()
}

/// One serial device.
///
/// All methods take `&self`; a `Port` can be shared across threads behind an
/// `Arc`. Dropping the last handle closes the device and stops the worker.
pub struct Port {
    path: String,
    name: String,
    opener: Arc<dyn DeviceOpener>,
    events: EventDispatcher,
    engine: EngineConfig,
    settings: Mutex<PortSettings>,
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
    io: Mutex<Option<IoThreads>>,
    lifecycle: Mutex<()>,
}

impl Port {
    pub fn builder(path: impl Into<String>) -> PortBuilder {
        PortBuilder::new(path)
    }

    /// Device path. Unique and immutable.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PortState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == PortState::Open
    }

    /// Last sampled CTS/DSR/DCD levels. All low while closed.
    pub fn pins(&self) -> PinState {
        self.shared.pins()
    }

    pub fn settings(&self) -> PortSettings {
        self.settings.lock().clone()
    }

    /// Open the device. Does nothing if the port is already open.
    ///
    /// Failures are reported to observers as well as returned, and leave the
    /// port closed.
    pub fn open(&self) -> Result<(), PortError> {
        let _lifecycle = self.lifecycle.lock();
        match self.state() {
            PortState::Open => return Ok(()),
            PortState::Removed => return Err(PortError::Removed),
            _ => {}
        }
        self.join_io();

        self.shared.set_state(PortState::Opening);
        info!(path = %self.path, "Opening serial port");

        let settings = self.settings();
        match self.attach(&settings) {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.state() == PortState::Opening {
                    self.shared.set_state(PortState::Closed);
                }
                error!(path = %self.path, error = %e, "Failed to open serial port");
                self.events.emit(PortEvent::Error(e.report(&self.path)));
                Err(e)
            }
        }
    }

    fn attach(&self, settings: &PortSettings) -> Result<(), PortError> {
        let mut device = self.opener.open(&self.path, settings)?;
        let (reader, poller, pins) = match self.prepare(device.as_mut(), settings) {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = device.restore();
                return Err(e);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        self.call(|reply| Command::Attach {
            device,
            stop: stop.clone(),
            pins,
            reply,
        })?;

        let config = IoConfig {
            path: self.path.clone(),
            chunk_size: self.engine.read_chunk_size,
            poll_interval: self.engine.pin_poll_interval(),
            initial_pins: pins,
        };
        match IoThreads::spawn(config, reader, poller, stop, self.commands.clone()) {
            Ok(threads) => {
                *self.io.lock() = Some(threads);
                Ok(())
            }
            Err(e) => {
                let _ = self.call(|reply| Command::Detach {
                    reason: DetachReason::Closed,
                    reply,
                });
                Err(PortError::Io(e))
            }
        }
    }

    /// Drive the output lines and clone handles for the I/O threads.
    fn prepare(
        &self,
        device: &mut dyn SerialPortAdapter,
        settings: &PortSettings,
    ) -> Result<(Box<dyn SerialPortAdapter>, Box<dyn SerialPortAdapter>, PinState), PortError> {
        // The caller's desired levels win over whatever the hardware had.
        device.write_request_to_send(settings.rts)?;
        device.write_data_terminal_ready(settings.dtr)?;
        let pins = device.read_pins().unwrap_or_default();

        let mut reader = device.try_clone_adapter()?;
        reader.set_timeout(self.engine.read_timeout())?;
        let poller = device.try_clone_adapter()?;
        Ok((reader, poller, pins))
    }

    /// Close the device. Does nothing if the port is not open.
    ///
    /// Every queued and pending request fails with
    /// [`RequestError::PortClosed`].
    pub fn close(&self) -> Result<(), PortError> {
        let _lifecycle = self.lifecycle.lock();
        match self.state() {
            PortState::Closed | PortState::Removed => {
                self.join_io();
                return Ok(());
            }
            _ => {}
        }

        self.shared.set_state(PortState::Closing);
        info!(path = %self.path, "Closing serial port");
        self.join_io();

        let result = self.call(|reply| Command::Detach {
            reason: DetachReason::Closed,
            reply,
        });
        if result.is_err() {
            self.shared.set_state(PortState::Closed);
        }
        result
    }

    /// The device left the system. Releases it if open and fails every
    /// outstanding request with [`RequestError::PortRemoved`]. The port
    /// cannot be opened again.
    pub fn mark_removed(&self) {
        let _lifecycle = self.lifecycle.lock();
        if self.state() == PortState::Removed {
            return;
        }
        info!(path = %self.path, "Serial device removed from system");
        self.join_io();
        if self
            .call(|reply| Command::Detach {
                reason: DetachReason::Removed,
                reply,
            })
            .is_err()
        {
            self.shared.set_state(PortState::Removed);
        }
    }

    fn join_io(&self) {
        if let Some(threads) = self.io.lock().take() {
            threads.stop();
        }
    }

    fn send_command(&self, command: Command) -> Result<(), PortError> {
        self.commands
            .send(command)
            .map_err(|_| PortError::EngineStopped)
    }

    /// Send a command and wait for the worker's reply.
    fn call<T>(&self, build: impl FnOnce(mpsc::Sender<T>) -> Command) -> Result<T, PortError> {
        let (reply, response) = mpsc::channel();
        self.send_command(build(reply))?;
        response.recv().map_err(|_| PortError::EngineStopped)
    }

    /// Write raw bytes outside the request queue.
    pub fn send_data(&self, data: impl Into<Vec<u8>>) -> Result<(), PortError> {
        let data = data.into();
        self.call(|reply| Command::Write { data, reply })?
    }

    /// Send `request`, or queue it behind the one in flight.
    ///
    /// Queuing always succeeds. A request sent immediately whose write fails
    /// is rejected with the write error and never becomes pending.
    pub fn submit(&self, request: Request) -> Result<ResponseHandle, PortError> {
        let completion = Completion::new();
        let handle = ResponseHandle::new(request.clone(), completion.clone());
        let entry = Queued {
            request,
            completion,
        };
        self.call(|reply| Command::Send { entry, reply })??;
        Ok(handle)
    }

    /// [`Port::submit`] without the handle; outcomes arrive as events.
    pub fn send_request(&self, request: Request) -> Result<(), PortError> {
        self.submit(request).map(|_| ())
    }

    /// Send `request` and block until it is answered, times out, or the port
    /// goes away.
    pub fn send_request_sync(&self, request: Request) -> RequestResult {
        let handle = self
            .submit(request)
            .map_err(|e| RequestError::Port(e.report(&self.path)))?;
        handle.wait()
    }

    /// Withdraw a request that has not been sent yet. Returns `false` if it
    /// is already on the wire or unknown.
    pub fn cancel_queued(&self, request: &Request) -> bool {
        let id = request.id();
        self.call(|reply| Command::CancelQueued { id, reply })
            .unwrap_or(false)
    }

    /// Withdraw every request that has not been sent yet. The pending
    /// request is unaffected.
    pub fn cancel_all_queued(&self) -> usize {
        self.call(|reply| Command::CancelAllQueued { reply })
            .unwrap_or(0)
    }

    /// Emit [`PortEvent::PacketReceived`] whenever `descriptor` matches.
    /// Registering the same descriptor twice has no effect.
    pub fn start_listening(&self, descriptor: PacketDescriptor) -> Result<(), PortError> {
        self.send_command(Command::Listen(descriptor))
    }

    pub fn stop_listening(&self, descriptor: &PacketDescriptor) -> Result<(), PortError> {
        self.send_command(Command::StopListening(descriptor.id()))
    }

    fn snapshot(&self) -> Snapshot {
        self.call(|reply| Command::Snapshot { reply })
            .unwrap_or_default()
    }

    pub fn packet_descriptors(&self) -> Vec<PacketDescriptor> {
        self.snapshot().descriptors
    }

    /// The request awaiting a response, if any.
    pub fn pending_request(&self) -> Option<Request> {
        self.snapshot().pending
    }

    /// Requests waiting behind the pending one, in send order.
    pub fn queued_requests(&self) -> Vec<Request> {
        self.snapshot().queued
    }

    /// Replace the line settings, applying them immediately if open.
    pub fn set_settings(&self, settings: PortSettings) -> Result<(), PortError> {
        settings.validate()?;
        *self.settings.lock() = settings.clone();
        debug!(path = %self.path, ?settings, "Updating line settings");
        self.call(|reply| Command::ApplySettings { settings, reply })?
    }

    /// Drive RTS. Remembered across reopen.
    pub fn set_rts(&self, level: bool) -> Result<(), PortError> {
        self.settings.lock().rts = level;
        self.call(|reply| Command::SetOutputLine {
            line: OutputLine::Rts,
            level,
            reply,
        })?
    }

    /// Drive DTR. Remembered across reopen.
    pub fn set_dtr(&self, level: bool) -> Result<(), PortError> {
        self.settings.lock().dtr = level;
        self.call(|reply| Command::SetOutputLine {
            line: OutputLine::Dtr,
            level,
            reply,
        })?
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("path", &self.path)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(path = %self.path, error = %e, "Close on drop failed");
        }
        let _ = self.send_command(Command::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(path = %self.path, "Port worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockOpener, MockSerialPort};
    use std::time::Duration;

    fn mock_port(path: &str) -> (Port, MockSerialPort, EventReceiver) {
        let device = MockSerialPort::new(path);
        let opener = MockOpener::new();
        opener.add(&device);
        let (events, receiver) = EventDispatcher::channel();
        let port = Port::builder(path)
            .opener(opener)
            .events(events)
            .build()
            .unwrap();
        (port, device, receiver)
    }

    #[test]
    fn test_display_name_defaults_to_basename() {
        assert_eq!(default_display_name("/dev/ttyUSB0"), "ttyUSB0");
        assert_eq!(default_display_name("COM3"), "COM3");
        assert_eq!(default_display_name(r"\\.\COM10"), "COM10");
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            PortState::Closed,
            PortState::Opening,
            PortState::Open,
            PortState::Closing,
            PortState::Removed,
        ] {
            assert_eq!(PortState::from_u8(state as u8), state);
        }
        assert_eq!(PortState::Open.to_string(), "open");
    }

    #[test]
    fn test_open_close_cycle() {
        let (port, _device, receiver) = mock_port("MOCK0");
        assert_eq!(port.state(), PortState::Closed);

        port.open().unwrap();
        assert!(port.is_open());
        port.open().unwrap();

        port.close().unwrap();
        assert_eq!(port.state(), PortState::Closed);
        port.close().unwrap();

        let events: Vec<_> = std::iter::from_fn(|| receiver.recv_timeout(Duration::from_millis(50)))
            .collect();
        assert!(matches!(events[0], PortEvent::Opened { .. }));
        assert!(matches!(events.last(), Some(PortEvent::Closed { .. })));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, PortEvent::Opened { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_operations_on_closed_port() {
        let (port, _device, _receiver) = mock_port("MOCK1");
        assert!(matches!(port.send_data(b"x".to_vec()), Err(PortError::NotOpen)));
        assert!(matches!(
            port.submit(Request::new(b"x".to_vec())),
            Err(PortError::NotOpen)
        ));
        // Settings are stored and applied on the next open.
        port.set_rts(true).unwrap();
        assert!(port.settings().rts);
    }

    #[test]
    fn test_removed_port_cannot_reopen() {
        let (port, _device, _receiver) = mock_port("MOCK2");
        port.mark_removed();
        assert_eq!(port.state(), PortState::Removed);
        assert!(matches!(port.open(), Err(PortError::Removed)));
    }
}
