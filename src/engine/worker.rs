//! The per-port worker thread.
//!
//! Everything that mutates a port's device handle, packet buffers or
//! request queue runs here, one [`Command`] at a time. Reader and poller
//! threads only feed commands in, so a byte arriving, a request being
//! queued and a timeout expiring can never interleave.

use super::events::{EventDispatcher, PortEvent};
use super::{PortState, Shared};
use crate::error::RequestError;
use crate::framing::{PacketDescriptor, PacketMatcher};
use crate::port::{PinState, PortError, PortSettings, SerialPortAdapter};
use crate::request::{Completion, Request};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Why the device is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DetachReason {
    Closed,
    Removed,
}

/// Which modem-control output to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputLine {
    Rts,
    Dtr,
}

/// A request together with the slot its outcome is written to.
#[derive(Debug)]
pub(crate) struct Queued {
    pub request: Request,
    pub completion: Arc<Completion>,
}

/// Point-in-time view of the worker's bookkeeping.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub descriptors: Vec<PacketDescriptor>,
    pub pending: Option<Request>,
    pub queued: Vec<Request>,
}

pub(crate) enum Command {
    Attach {
        device: Box<dyn SerialPortAdapter>,
        stop: Arc<AtomicBool>,
        pins: PinState,
        reply: Sender<()>,
    },
    Detach {
        reason: DetachReason,
        reply: Sender<()>,
    },
    DeviceGone {
        error: PortError,
    },
    ReadFailed {
        error: PortError,
    },
    Received(Vec<u8>),
    PinsChanged(PinState),
    Write {
        data: Vec<u8>,
        reply: Sender<Result<(), PortError>>,
    },
    Send {
        entry: Queued,
        reply: Sender<Result<(), PortError>>,
    },
    CancelQueued {
        id: Uuid,
        reply: Sender<bool>,
    },
    CancelAllQueued {
        reply: Sender<usize>,
    },
    Listen(PacketDescriptor),
    StopListening(Uuid),
    ApplySettings {
        settings: PortSettings,
        reply: Sender<Result<(), PortError>>,
    },
    SetOutputLine {
        line: OutputLine,
        level: bool,
        reply: Sender<Result<(), PortError>>,
    },
    Snapshot {
        reply: Sender<Snapshot>,
    },
    Shutdown,
}

/// The request currently on the wire.
struct Pending {
    entry: Queued,
    matcher: PacketMatcher,
    deadline: Option<Instant>,
}

pub(crate) struct Worker {
    path: String,
    shared: Arc<Shared>,
    events: EventDispatcher,
    device: Option<Box<dyn SerialPortAdapter>>,
    io_stop: Option<Arc<AtomicBool>>,
    matchers: Vec<PacketMatcher>,
    pending: Option<Pending>,
    queue: VecDeque<Queued>,
}

impl Worker {
    pub(crate) fn new(path: String, shared: Arc<Shared>, events: EventDispatcher) -> Self {
        Self {
            path,
            shared,
            events,
            device: None,
            io_stop: None,
            matchers: Vec::new(),
            pending: None,
            queue: VecDeque::new(),
        }
    }

    /// Process commands until shutdown or until every sender is gone.
    pub(crate) fn run(mut self, commands: Receiver<Command>) {
        debug!(path = %self.path, "Port worker started");
        loop {
            let command = match self.deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.expire();
                        continue;
                    }
                    match commands.recv_timeout(deadline - now) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match commands.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };

            // A response that shows up after the deadline loses to the timeout.
            if self.deadline().is_some_and(|deadline| Instant::now() >= deadline) {
                self.expire();
            }

            if !self.handle(command) {
                break;
            }
        }

        self.detach(DetachReason::Closed);
        debug!(path = %self.path, "Port worker stopped");
    }

    fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().and_then(|pending| pending.deadline)
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Attach {
                device,
                stop,
                pins,
                reply,
            } => {
                self.device = Some(device);
                self.io_stop = Some(stop);
                self.shared.set_pins(pins);
                self.shared.set_state(PortState::Open);
                info!(path = %self.path, "Serial port opened");
                self.emit(PortEvent::Opened {
                    path: self.path.clone(),
                });
                let _ = reply.send(());
            }
            Command::Detach { reason, reply } => {
                self.detach(reason);
                let _ = reply.send(());
            }
            Command::DeviceGone { error } => {
                if self.device.is_some() {
                    warn!(path = %self.path, error = %error, "Serial device went away");
                    self.emit(PortEvent::Error(error.report(&self.path)));
                    self.detach(DetachReason::Removed);
                }
            }
            Command::ReadFailed { error } => {
                if self.device.is_some() {
                    self.emit(PortEvent::Error(error.report(&self.path)));
                }
            }
            Command::Received(data) => self.receive(data),
            Command::PinsChanged(pins) => {
                if self.device.is_some() {
                    self.shared.set_pins(pins);
                    trace!(path = %self.path, ?pins, "Modem status lines changed");
                    self.emit(PortEvent::PinsChanged {
                        path: self.path.clone(),
                        pins,
                    });
                }
            }
            Command::Write { data, reply } => {
                let result = self.write(&data);
                let _ = reply.send(result);
            }
            Command::Send { entry, reply } => {
                let result = self.submit(entry);
                let _ = reply.send(result);
            }
            Command::CancelQueued { id, reply } => {
                let _ = reply.send(self.cancel_queued(id));
            }
            Command::CancelAllQueued { reply } => {
                let cancelled = self.queue.len();
                for entry in self.queue.drain(..) {
                    entry.completion.settle(Err(RequestError::Cancelled));
                }
                if cancelled > 0 {
                    debug!(path = %self.path, cancelled, "Cleared request queue");
                }
                let _ = reply.send(cancelled);
            }
            Command::Listen(descriptor) => {
                if !self.matchers.iter().any(|m| m.descriptor() == &descriptor) {
                    debug!(path = %self.path, descriptor = %descriptor.id(), "Listening for packets");
                    self.matchers.push(PacketMatcher::new(descriptor));
                }
            }
            Command::StopListening(id) => {
                self.matchers.retain(|m| m.descriptor().id() != id);
            }
            Command::ApplySettings { settings, reply } => {
                let result = self.apply_settings(&settings);
                let _ = reply.send(result);
            }
            Command::SetOutputLine { line, level, reply } => {
                let result = self.set_output_line(line, level);
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Snapshot {
                    descriptors: self
                        .matchers
                        .iter()
                        .map(|m| m.descriptor().clone())
                        .collect(),
                    pending: self.pending.as_ref().map(|p| p.entry.request.clone()),
                    queued: self.queue.iter().map(|e| e.request.clone()).collect(),
                });
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn emit(&self, event: PortEvent) {
        self.events.emit(event);
    }

    fn report_error(&self, error: &PortError) {
        warn!(path = %self.path, error = %error, "Serial port error");
        self.emit(PortEvent::Error(error.report(&self.path)));
    }

    fn receive(&mut self, data: Vec<u8>) {
        if self.device.is_none() {
            return;
        }
        trace!(path = %self.path, len = data.len(), "Received data");
        self.emit(PortEvent::DataReceived {
            path: self.path.clone(),
            data: data.clone(),
        });

        for &byte in &data {
            for matcher in &mut self.matchers {
                if let Some(packet) = matcher.feed(byte) {
                    self.events.emit(PortEvent::PacketReceived {
                        path: self.path.clone(),
                        data: packet,
                        descriptor: matcher.descriptor().clone(),
                    });
                }
            }

            let response = self
                .pending
                .as_mut()
                .and_then(|pending| pending.matcher.feed(byte));
            if let Some(response) = response {
                self.resolve(response);
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PortError> {
        let device = self.device.as_mut().ok_or(PortError::NotOpen)?;
        if let Err(e) = device.write_all_bytes(data) {
            self.report_error(&e);
            return Err(e);
        }
        Ok(())
    }

    fn submit(&mut self, entry: Queued) -> Result<(), PortError> {
        if self.device.is_none() {
            return Err(PortError::NotOpen);
        }
        if self.pending.is_some() {
            debug!(
                path = %self.path,
                request = %entry.request.id(),
                queued = self.queue.len() + 1,
                "Queued request"
            );
            self.queue.push_back(entry);
            return Ok(());
        }

        if let Err(e) = self.start(entry) {
            self.report_error(&e);
            return Err(e);
        }
        self.advance();
        Ok(())
    }

    /// Put `entry` on the wire. Requests without a response descriptor
    /// complete as soon as they are written.
    fn start(&mut self, entry: Queued) -> Result<(), PortError> {
        let device = self.device.as_mut().ok_or(PortError::NotOpen)?;
        let deadline = entry.request.timeout().map(|t| Instant::now() + t);
        device.write_all_bytes(entry.request.data())?;

        match entry.request.response_descriptor() {
            Some(descriptor) => {
                debug!(path = %self.path, request = %entry.request.id(), "Request sent, awaiting response");
                self.pending = Some(Pending {
                    matcher: PacketMatcher::new(descriptor.clone()),
                    entry,
                    deadline,
                });
            }
            None => {
                debug!(path = %self.path, request = %entry.request.id(), "Request sent, no response expected");
                entry.completion.settle(Ok(None));
            }
        }
        Ok(())
    }

    /// Start queued requests until one is awaiting a response or the queue
    /// is empty.
    fn advance(&mut self) {
        while self.pending.is_none() {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            let request = entry.request.clone();
            let completion = entry.completion.clone();
            if let Err(e) = self.start(entry) {
                self.report_error(&e);
                let error = RequestError::Port(e.report(&self.path));
                self.emit(PortEvent::RequestFailed {
                    path: self.path.clone(),
                    request,
                    error: error.clone(),
                });
                completion.settle(Err(error));
            }
        }
    }

    fn resolve(&mut self, response: Vec<u8>) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        debug!(path = %self.path, request = %pending.entry.request.id(), "Response received");
        self.emit(PortEvent::ResponseReceived {
            path: self.path.clone(),
            data: response.clone(),
            request: pending.entry.request.clone(),
        });
        pending.entry.completion.settle(Ok(Some(response)));
        self.advance();
    }

    fn expire(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        info!(path = %self.path, request = %pending.entry.request.id(), "Request timed out");
        self.emit(PortEvent::RequestTimedOut {
            path: self.path.clone(),
            request: pending.entry.request.clone(),
        });
        pending.entry.completion.settle(Err(RequestError::TimedOut));
        self.advance();
    }

    fn cancel_queued(&mut self, id: Uuid) -> bool {
        let Some(index) = self.queue.iter().position(|e| e.request.id() == id) else {
            return false;
        };
        if let Some(entry) = self.queue.remove(index) {
            debug!(path = %self.path, request = %id, "Cancelled queued request");
            entry.completion.settle(Err(RequestError::Cancelled));
        }
        true
    }

    fn apply_settings(&mut self, settings: &PortSettings) -> Result<(), PortError> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let result = device
            .apply_settings(settings)
            .and_then(|()| device.write_request_to_send(settings.rts))
            .and_then(|()| device.write_data_terminal_ready(settings.dtr));
        if let Err(e) = &result {
            self.report_error(e);
        }
        result
    }

    fn set_output_line(&mut self, line: OutputLine, level: bool) -> Result<(), PortError> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let result = match line {
            OutputLine::Rts => device.write_request_to_send(level),
            OutputLine::Dtr => device.write_data_terminal_ready(level),
        };
        if let Err(e) = &result {
            self.report_error(e);
        }
        result
    }

    /// Release the device and fail every outstanding request.
    fn detach(&mut self, reason: DetachReason) {
        match reason {
            DetachReason::Closed if self.device.is_none() => return,
            DetachReason::Removed if self.shared.state() == PortState::Removed => return,
            _ => {}
        }

        if let Some(stop) = self.io_stop.take() {
            stop.store(true, Ordering::SeqCst);
        }
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.restore() {
                debug!(path = %self.path, error = %e, "Could not restore original line settings");
            }
        }
        for matcher in &mut self.matchers {
            matcher.reset();
        }
        self.shared.set_pins(PinState::default());

        let (state, event, error) = match reason {
            DetachReason::Closed => (
                PortState::Closed,
                PortEvent::Closed {
                    path: self.path.clone(),
                },
                RequestError::PortClosed,
            ),
            DetachReason::Removed => (
                PortState::Removed,
                PortEvent::Removed {
                    path: self.path.clone(),
                },
                RequestError::PortRemoved,
            ),
        };
        self.shared.set_state(state);
        info!(path = %self.path, ?reason, "Serial port released");
        self.emit(event);

        let outstanding = self
            .pending
            .take()
            .map(|p| p.entry)
            .into_iter()
            .chain(self.queue.drain(..))
            .collect::<Vec<_>>();
        for entry in outstanding {
            self.emit(PortEvent::RequestFailed {
                path: self.path.clone(),
                request: entry.request.clone(),
                error: error.clone(),
            });
            entry.completion.settle(Err(error.clone()));
        }
    }
}
