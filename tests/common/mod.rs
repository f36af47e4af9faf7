//! Shared test utilities for serial_link integration tests.
//!
//! This module provides common test infrastructure including:
//! - Mock-backed ports with an event channel attached
//! - Event helpers that wait for a specific kind of event

#![allow(dead_code)]

use serial_link::config::EngineConfig;
use serial_link::port::{MockOpener, MockSerialPort};
use serial_link::{EventDispatcher, EventReceiver, Port, PortEvent, PortSettings};
use std::time::{Duration, Instant};

/// Default wait for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A port wired to a mock device.
pub struct Harness {
    pub port: Port,
    pub device: MockSerialPort,
    pub opener: MockOpener,
    pub events: EventReceiver,
}

/// Engine settings that keep tests quick.
pub fn fast_engine() -> EngineConfig {
    EngineConfig {
        pin_poll_interval_ms: 5,
        read_timeout_ms: 10,
        read_chunk_size: 64,
    }
}

/// Build (but do not open) a port backed by a fresh mock device.
pub fn harness(path: &str) -> Harness {
    harness_with_settings(path, PortSettings::default())
}

pub fn harness_with_settings(path: &str, settings: PortSettings) -> Harness {
    let device = MockSerialPort::new(path);
    let opener = MockOpener::new();
    opener.add(&device);
    let (dispatcher, events) = EventDispatcher::channel();
    let port = Port::builder(path)
        .settings(settings)
        .engine(fast_engine())
        .opener(opener.clone())
        .events(dispatcher)
        .build()
        .expect("port worker should start");
    Harness {
        port,
        device,
        opener,
        events,
    }
}

/// Build and open a port backed by a fresh mock device, consuming the
/// `Opened` event.
pub fn open_harness(path: &str) -> Harness {
    let h = harness(path);
    h.port.open().expect("mock port should open");
    expect_event(&h.events, |e| matches!(e, PortEvent::Opened { .. }));
    h
}

/// Wait for the first event satisfying `predicate`, skipping others.
///
/// Panics if none arrives within [`EVENT_TIMEOUT`].
pub fn expect_event(events: &EventReceiver, predicate: impl Fn(&PortEvent) -> bool) -> PortEvent {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Some(event) if predicate(&event) => return event,
            Some(_) => continue,
            None => panic!("expected event did not arrive within {:?}", EVENT_TIMEOUT),
        }
    }
}

/// Collect every event that arrives within `window`.
pub fn drain_events(events: &EventReceiver, window: Duration) -> Vec<PortEvent> {
    let deadline = Instant::now() + window;
    let mut collected = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Some(event) => collected.push(event),
            None => break,
        }
    }
    collected
}

/// Packet payloads from `events`, in order.
pub fn packets(events: &[PortEvent]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            PortEvent::PacketReceived { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect()
}
