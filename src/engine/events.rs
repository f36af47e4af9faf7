//! Observer events and their delivery.
//!
//! Port workers never call observer code directly. They push [`PortEvent`]s
//! into an [`EventDispatcher`], and the consumer decides which thread the
//! observer runs on: its own (pumping an [`EventReceiver`]) or a dedicated
//! delivery thread ([`EventDispatcher::spawn`]). Either way every callback
//! runs on a single context, in emission order.

use crate::error::{ErrorReport, RequestError};
use crate::framing::PacketDescriptor;
use crate::port::PinState;
use crate::request::Request;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::trace;

/// Something that happened on a port.
#[derive(Debug, Clone)]
pub enum PortEvent {
    Opened {
        path: String,
    },
    Closed {
        path: String,
    },
    /// The device disappeared. The port cannot be reopened.
    Removed {
        path: String,
    },
    /// A raw chunk as read from the device.
    DataReceived {
        path: String,
        data: Vec<u8>,
    },
    /// A registered descriptor matched.
    PacketReceived {
        path: String,
        data: Vec<u8>,
        descriptor: PacketDescriptor,
    },
    /// The pending request's response descriptor matched.
    ResponseReceived {
        path: String,
        data: Vec<u8>,
        request: Request,
    },
    RequestTimedOut {
        path: String,
        request: Request,
    },
    /// A request ended without a response for a reason other than timeout.
    RequestFailed {
        path: String,
        request: Request,
        error: RequestError,
    },
    /// An OS-level failure.
    Error(ErrorReport),
    /// CTS, DSR or DCD changed level.
    PinsChanged {
        path: String,
        pins: PinState,
    },
}

impl PortEvent {
    /// Path of the port the event belongs to.
    pub fn path(&self) -> &str {
        match self {
            Self::Opened { path }
            | Self::Closed { path }
            | Self::Removed { path }
            | Self::DataReceived { path, .. }
            | Self::PacketReceived { path, .. }
            | Self::ResponseReceived { path, .. }
            | Self::RequestTimedOut { path, .. }
            | Self::RequestFailed { path, .. }
            | Self::PinsChanged { path, .. } => path,
            Self::Error(report) => &report.path,
        }
    }

    /// Invoke the matching observer method.
    pub fn dispatch_to(&self, observer: &mut dyn PortObserver) {
        match self {
            Self::Opened { path } => observer.port_opened(path),
            Self::Closed { path } => observer.port_closed(path),
            Self::Removed { path } => observer.port_removed(path),
            Self::DataReceived { path, data } => observer.data_received(path, data),
            Self::PacketReceived {
                path,
                data,
                descriptor,
            } => observer.packet_received(path, data, descriptor),
            Self::ResponseReceived {
                path,
                data,
                request,
            } => observer.response_received(path, data, request),
            Self::RequestTimedOut { path, request } => observer.request_timed_out(path, request),
            Self::RequestFailed {
                path,
                request,
                error,
            } => observer.request_failed(path, request, error),
            Self::Error(report) => observer.error(report),
            Self::PinsChanged { path, pins } => observer.pins_changed(path, *pins),
        }
    }
}

/// Callbacks for port activity. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait PortObserver {
    fn port_opened(&mut self, path: &str) {}
    fn port_closed(&mut self, path: &str) {}
    fn port_removed(&mut self, path: &str) {}
    fn data_received(&mut self, path: &str, data: &[u8]) {}
    fn packet_received(&mut self, path: &str, data: &[u8], descriptor: &PacketDescriptor) {}
    fn response_received(&mut self, path: &str, data: &[u8], request: &Request) {}
    fn request_timed_out(&mut self, path: &str, request: &Request) {}
    fn request_failed(&mut self, path: &str, request: &Request, error: &RequestError) {}
    fn error(&mut self, report: &ErrorReport) {}
    fn pins_changed(&mut self, path: &str, pins: PinState) {}
}

/// Cloneable sink ports emit events into.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: Option<mpsc::Sender<PortEvent>>,
}

impl EventDispatcher {
    /// Events are queued for the returned receiver.
    pub fn channel() -> (Self, EventReceiver) {
        let (sender, receiver) = mpsc::channel();
        (
            Self {
                sender: Some(sender),
            },
            EventReceiver { receiver },
        )
    }

    /// Events are delivered to `observer` on a dedicated thread. The thread
    /// exits and hands the observer back once every dispatcher clone is dropped.
    pub fn spawn<O>(mut observer: O) -> std::io::Result<(Self, thread::JoinHandle<O>)>
    where
        O: PortObserver + Send + 'static,
    {
        let (dispatcher, receiver) = Self::channel();
        let handle = thread::Builder::new()
            .name("serial-link-events".into())
            .spawn(move || {
                receiver.dispatch_blocking(&mut observer);
                observer
            })?;
        Ok((dispatcher, handle))
    }

    /// Events are dropped.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn emit(&self, event: PortEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                trace!("Event receiver dropped; discarding event");
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Consumer end of [`EventDispatcher::channel`].
#[derive(Debug)]
pub struct EventReceiver {
    receiver: mpsc::Receiver<PortEvent>,
}

impl EventReceiver {
    /// Block for the next event. `None` once every dispatcher is gone.
    pub fn recv(&self) -> Option<PortEvent> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<PortEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<PortEvent> {
        self.receiver.try_recv().ok()
    }

    /// Deliver every queued event to `observer` without blocking. Returns the
    /// number delivered.
    pub fn dispatch_pending(&self, observer: &mut dyn PortObserver) -> usize {
        let mut delivered = 0;
        while let Ok(event) = self.receiver.try_recv() {
            event.dispatch_to(observer);
            delivered += 1;
        }
        delivered
    }

    /// Deliver events to `observer` until every dispatcher is dropped.
    pub fn dispatch_blocking(&self, observer: &mut dyn PortObserver) {
        for event in self.receiver.iter() {
            event.dispatch_to(observer);
        }
    }
}
