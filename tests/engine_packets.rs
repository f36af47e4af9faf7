//! Packet detection through a live port.

mod common;

use common::{drain_events, expect_event, open_harness, packets};
use pretty_assertions::assert_eq;
use serial_link::{PacketDescriptor, PortEvent};
use std::time::Duration;

const SETTLE: Duration = Duration::from_millis(150);

#[test]
fn test_split_packet_is_reported_once() {
    let h = open_harness("PKT0");
    let descriptor = PacketDescriptor::delimited_str("!pos", ";", 8).unwrap();
    h.port.start_listening(descriptor.clone()).unwrap();

    h.device.enqueue_read(b"!po");
    expect_event(&h.events, |e| matches!(e, PortEvent::DataReceived { .. }));
    h.device.enqueue_read(b"s12;");

    let event = expect_event(&h.events, |e| matches!(e, PortEvent::PacketReceived { .. }));
    match event {
        PortEvent::PacketReceived {
            path,
            data,
            descriptor: matched,
        } => {
            assert_eq!(path, "PKT0");
            assert_eq!(data, b"!pos12;".to_vec());
            assert_eq!(matched, descriptor);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The buffer was emptied by the match, so a bare suffix cannot complete
    // a second packet from the old prefix.
    h.device.enqueue_read(b"xx;");
    assert!(packets(&drain_events(&h.events, SETTLE)).is_empty());
}

#[test]
fn test_data_event_precedes_packet_event() {
    let h = open_harness("PKT1");
    h.port
        .start_listening(PacketDescriptor::fixed(b"OK".to_vec()))
        .unwrap();

    h.device.enqueue_read(b"OK");
    let events = drain_events(&h.events, SETTLE);
    let data_at = events
        .iter()
        .position(|e| matches!(e, PortEvent::DataReceived { .. }))
        .expect("data event");
    let packet_at = events
        .iter()
        .position(|e| matches!(e, PortEvent::PacketReceived { .. }))
        .expect("packet event");
    assert!(data_at < packet_at);
}

#[test]
fn test_descriptors_match_independently() {
    let h = open_harness("PKT2");
    let delimited = PacketDescriptor::delimited_str("A", ";", 4).unwrap();
    let fixed = PacketDescriptor::fixed(b"XY".to_vec());
    h.port.start_listening(delimited.clone()).unwrap();
    h.port.start_listening(fixed.clone()).unwrap();

    h.device.enqueue_read(b"A1;XY");
    let events = drain_events(&h.events, SETTLE);

    let matched: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PortEvent::PacketReceived {
                data, descriptor, ..
            } => Some((data.clone(), descriptor.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        matched,
        vec![(b"A1;".to_vec(), delimited), (b"XY".to_vec(), fixed)]
    );
}

#[test]
fn test_listening_twice_has_no_effect() {
    let h = open_harness("PKT3");
    let descriptor = PacketDescriptor::fixed(b"PING".to_vec());
    h.port.start_listening(descriptor.clone()).unwrap();
    h.port.start_listening(descriptor.clone()).unwrap();
    assert_eq!(h.port.packet_descriptors(), vec![descriptor.clone()]);

    h.device.enqueue_read(b"PING");
    assert_eq!(packets(&drain_events(&h.events, SETTLE)), vec![b"PING".to_vec()]);

    // Equal arguments still make a distinct descriptor.
    let twin = PacketDescriptor::fixed(b"PING".to_vec());
    h.port.start_listening(twin).unwrap();
    assert_eq!(h.port.packet_descriptors().len(), 2);
}

#[test]
fn test_stop_listening() {
    let h = open_harness("PKT4");
    let descriptor = PacketDescriptor::fixed(b"PING".to_vec());
    h.port.start_listening(descriptor.clone()).unwrap();
    h.port.stop_listening(&descriptor).unwrap();
    assert!(h.port.packet_descriptors().is_empty());

    h.device.enqueue_read(b"PING");
    let events = drain_events(&h.events, SETTLE);
    assert!(events
        .iter()
        .any(|e| matches!(e, PortEvent::DataReceived { .. })));
    assert!(packets(&events).is_empty());
}

#[test]
fn test_pattern_descriptor() {
    let h = open_harness("PKT5");
    h.port
        .start_listening(PacketDescriptor::pattern_str(r"^\$GP[A-Z]{3},[^*]*\*[0-9A-F]{2}$", 82).unwrap())
        .unwrap();

    h.device.enqueue_read(b"noise$GPGGA,1,2*4F\r\n");
    assert_eq!(
        packets(&drain_events(&h.events, SETTLE)),
        vec![b"$GPGGA,1,2*4F".to_vec()]
    );
}
