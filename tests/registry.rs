//! Device tracking, hot-plug and sleep/wake handling.

mod common;

use serial_link::port::{MockEnumerator, MockOpener, MockSerialPort};
use serial_link::{Config, EventDispatcher, PortRegistry, PortState, RegistryEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Fixture {
    registry: PortRegistry,
    enumerator: MockEnumerator,
    opener: MockOpener,
}

fn fixture() -> Fixture {
    let mut config = Config::default();
    config.engine = common::fast_engine();
    let enumerator = MockEnumerator::new();
    let opener = MockOpener::new();
    let registry = PortRegistry::new(
        enumerator.clone(),
        Arc::new(opener.clone()),
        &config,
        EventDispatcher::disabled(),
    )
    .unwrap();
    Fixture {
        registry,
        enumerator,
        opener,
    }
}

impl Fixture {
    fn plug(&self, path: &str) -> MockSerialPort {
        let device = MockSerialPort::new(path);
        self.opener.add(&device);
        self.enumerator.plug(path, path);
        device
    }
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_removal_tears_down_open_port() {
    let f = fixture();
    let device = f.plug("/dev/ttyACM0");
    f.registry.refresh().unwrap();

    let port = f.registry.port("/dev/ttyACM0").unwrap();
    port.open().unwrap();
    let pending = port
        .submit(
            serial_link::Request::new(b"Q;".to_vec()).with_response(
                serial_link::PacketDescriptor::delimited_str("R", ";", 8).unwrap(),
            ),
        )
        .unwrap();

    f.enumerator.unplug("/dev/ttyACM0");
    f.registry.refresh().unwrap();

    assert_eq!(port.state(), PortState::Removed);
    assert_eq!(
        pending.wait_timeout(Duration::from_secs(2)),
        Some(Err(serial_link::RequestError::PortRemoved))
    );
    assert_eq!(device.restore_count(), 1);
    assert!(f.registry.ports().is_empty());
}

#[test]
fn test_returning_device_gets_a_fresh_port() {
    let f = fixture();
    let events = f.registry.subscribe();
    f.plug("/dev/ttyUSB0");
    f.registry.refresh().unwrap();
    let before = f.registry.port("/dev/ttyUSB0").unwrap();

    f.enumerator.unplug("/dev/ttyUSB0");
    f.registry.refresh().unwrap();
    f.enumerator.plug("/dev/ttyUSB0", "ttyUSB0");
    f.registry.refresh().unwrap();

    let after = f.registry.port("/dev/ttyUSB0").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(before.state(), PortState::Removed);
    assert_eq!(after.state(), PortState::Closed);
    after.open().unwrap();

    let kinds: Vec<_> = events
        .try_iter()
        .map(|e| match e {
            RegistryEvent::PortsConnected(_) => "connected",
            RegistryEvent::PortsDisconnected(_) => "disconnected",
        })
        .collect();
    assert_eq!(kinds, vec!["connected", "disconnected", "connected"]);
}

#[test]
fn test_port_lost_between_scans_is_replaced() {
    let f = fixture();
    let events = f.registry.subscribe();
    let device = f.plug("/dev/ttyUSB3");
    f.registry.refresh().unwrap();
    let before = f.registry.port("/dev/ttyUSB3").unwrap();
    before.open().unwrap();

    // The engine notices the loss on its own; the path never leaves the scan.
    device.disconnect();
    assert!(wait_until(|| before.state() == PortState::Removed));
    device.reconnect();
    f.registry.refresh().unwrap();

    let after = f.registry.port("/dev/ttyUSB3").unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.state(), PortState::Closed);
    after.open().unwrap();
    assert_eq!(after.state(), PortState::Open);

    let kinds: Vec<_> = events
        .try_iter()
        .map(|e| match e {
            RegistryEvent::PortsConnected(_) => "connected",
            RegistryEvent::PortsDisconnected(ports) => {
                assert!(Arc::ptr_eq(&ports[0], &before));
                "disconnected"
            }
        })
        .collect();
    assert_eq!(kinds, vec!["connected", "disconnected", "connected"]);
}

#[test]
fn test_lost_port_replaced_on_lookup_and_push() {
    let f = fixture();
    let events = f.registry.subscribe();
    let device = f.plug("/dev/ttyUSB4");
    let first = f.registry.get_or_insert("/dev/ttyUSB4").unwrap();
    first.open().unwrap();
    device.disconnect();
    assert!(wait_until(|| first.state() == PortState::Removed));
    device.reconnect();

    let second = f.registry.get_or_insert("/dev/ttyUSB4").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &f.registry.get_or_insert("/dev/ttyUSB4").unwrap()));
    match events.try_recv() {
        Ok(RegistryEvent::PortsDisconnected(ports)) => assert!(Arc::ptr_eq(&ports[0], &first)),
        other => panic!("unexpected event {:?}", other),
    }

    second.open().unwrap();
    device.disconnect();
    assert!(wait_until(|| second.state() == PortState::Removed));
    device.reconnect();

    let added = f
        .registry
        .handle_arrivals(&[serial_link::DeviceInfo::new("/dev/ttyUSB4", "ttyUSB4")]);
    assert_eq!(added.len(), 1);
    assert!(!Arc::ptr_eq(&added[0], &second));
    assert!(f
        .registry
        .handle_arrivals(&[serial_link::DeviceInfo::new("/dev/ttyUSB4", "ttyUSB4")])
        .is_empty());
}

#[test]
fn test_sleep_and_wake_reopen_only_open_ports() {
    let f = fixture();
    f.plug("/dev/ttyS1");
    f.plug("/dev/ttyS2");
    f.registry.refresh().unwrap();

    let open = f.registry.port("/dev/ttyS1").unwrap();
    let idle = f.registry.port("/dev/ttyS2").unwrap();
    open.open().unwrap();

    f.registry.system_will_sleep();
    assert_eq!(open.state(), PortState::Closed);

    f.registry.system_did_wake();
    assert!(open.is_open());
    assert_eq!(idle.state(), PortState::Closed);
    assert_eq!(f.opener.open_count("/dev/ttyS1"), 2);
    assert_eq!(f.opener.open_count("/dev/ttyS2"), 0);

    // A second wake without a sleep does nothing.
    f.registry.system_did_wake();
    assert_eq!(f.opener.open_count("/dev/ttyS1"), 2);

    f.registry.close_all();
    assert_eq!(open.state(), PortState::Closed);
}

#[test]
fn test_push_notifications() {
    let f = fixture();
    let added = f
        .registry
        .handle_arrivals(&[serial_link::DeviceInfo::new("/dev/ttyX", "Widget")]);
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].name(), "Widget");

    let removed = f.registry.handle_removals(&["/dev/ttyX".to_string()]);
    assert_eq!(removed.len(), 1);
    assert!(f.registry.handle_removals(&["/dev/ttyX".to_string()]).is_empty());
}

#[test]
fn test_watcher_follows_devices() {
    let f = fixture();
    let watcher = f.registry.spawn_watcher(Duration::from_millis(10)).unwrap();

    f.plug("/dev/ttyW0");
    assert!(wait_until(|| f.registry.port("/dev/ttyW0").is_some()));

    f.enumerator.unplug("/dev/ttyW0");
    assert!(wait_until(|| f.registry.port("/dev/ttyW0").is_none()));

    drop(watcher);
    f.plug("/dev/ttyW1");
    std::thread::sleep(Duration::from_millis(50));
    assert!(f.registry.port("/dev/ttyW1").is_none());
}
