//! Request queueing, responses, timeouts and port lifecycle.

mod common;

use common::{drain_events, expect_event, harness, harness_with_settings, open_harness};
use pretty_assertions::assert_eq;
use serial_link::error::{ENGINE_DOMAIN, POSIX_DOMAIN};
use serial_link::{
    PacketDescriptor, PinState, PortError, PortEvent, PortSettings, PortState, Request,
    RequestError,
};
use std::time::Duration;

const SETTLE: Duration = Duration::from_millis(150);
const WAIT: Duration = Duration::from_secs(2);

fn request(data: &[u8], response_prefix: &str) -> Request {
    let descriptor = PacketDescriptor::delimited_str(response_prefix, ";", 32).unwrap();
    Request::new(data.to_vec()).with_response(descriptor)
}

#[test]
fn test_requests_run_in_submission_order() {
    let h = open_harness("REQ0");
    h.device.respond_to(b"Q1;", b"R1;");
    h.device.respond_to(b"Q2;", b"R2;");
    h.device.respond_to(b"Q3;", b"R3;");

    let handles: Vec<_> = ["Q1;", "Q2;", "Q3;"]
        .iter()
        .map(|q| h.port.submit(request(q.as_bytes(), "R")).unwrap())
        .collect();

    let responses: Vec<_> = handles
        .iter()
        .map(|handle| handle.wait_timeout(WAIT).expect("settled").unwrap())
        .collect();
    assert_eq!(
        responses,
        vec![
            Some(b"R1;".to_vec()),
            Some(b"R2;".to_vec()),
            Some(b"R3;".to_vec())
        ]
    );
    assert_eq!(
        h.device.get_write_log(),
        vec![b"Q1;".to_vec(), b"Q2;".to_vec(), b"Q3;".to_vec()]
    );
}

#[test]
fn test_one_request_on_the_wire_at_a_time() {
    let h = open_harness("REQ1");
    let first = request(b"Q1;", "R1");
    let second = request(b"Q2;", "R2");
    let third = request(b"Q3;", "R3");

    let first_handle = h.port.submit(first.clone()).unwrap();
    let second_handle = h.port.submit(second.clone()).unwrap();
    h.port.submit(third.clone()).unwrap();

    assert_eq!(h.port.pending_request(), Some(first.clone()));
    assert_eq!(h.port.queued_requests(), vec![second.clone(), third.clone()]);
    assert_eq!(h.device.get_write_log(), vec![b"Q1;".to_vec()]);
    assert!(second_handle.wait_timeout(Duration::from_millis(50)).is_none());

    h.device.enqueue_read(b"R1;");
    assert_eq!(
        first_handle.wait_timeout(WAIT).expect("settled"),
        Ok(Some(b"R1;".to_vec()))
    );
    match expect_event(&h.events, |e| matches!(e, PortEvent::ResponseReceived { .. })) {
        PortEvent::ResponseReceived { data, request, .. } => {
            assert_eq!(data, b"R1;".to_vec());
            assert_eq!(request, first);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(h.port.pending_request(), Some(second));
    assert_eq!(h.port.queued_requests(), vec![third]);
    assert_eq!(
        h.device.get_write_log(),
        vec![b"Q1;".to_vec(), b"Q2;".to_vec()]
    );
}

#[test]
fn test_requests_without_response_complete_on_write() {
    let h = open_harness("REQ2");
    let first = h.port.submit(request(b"Q1;", "R1")).unwrap();
    let fire_a = h.port.submit(Request::new(b"A;".to_vec())).unwrap();
    let fire_b = h.port.submit(Request::new(b"B;".to_vec())).unwrap();
    let last = request(b"Q2;", "R2");
    h.port.submit(last.clone()).unwrap();
    assert!(!fire_a.is_settled());

    h.device.enqueue_read(b"R1;");
    assert_eq!(first.wait_timeout(WAIT).expect("settled"), Ok(Some(b"R1;".to_vec())));
    assert_eq!(fire_a.wait_timeout(WAIT).expect("settled"), Ok(None));
    assert_eq!(fire_b.wait_timeout(WAIT).expect("settled"), Ok(None));

    assert_eq!(h.port.pending_request(), Some(last));
    assert_eq!(
        h.device.get_write_log(),
        vec![
            b"Q1;".to_vec(),
            b"A;".to_vec(),
            b"B;".to_vec(),
            b"Q2;".to_vec()
        ]
    );
}

#[test]
fn test_late_response_loses_to_timeout() {
    let h = open_harness("REQ3");
    let temp = PacketDescriptor::delimited_str("!TEMP", ";", 10).unwrap();
    let query = Request::new(b"$TEMP?;".to_vec())
        .with_response(temp)
        .with_timeout(Duration::from_millis(50));

    let handle = h.port.submit(query.clone()).unwrap();
    assert_eq!(handle.wait_timeout(WAIT), Some(Err(RequestError::TimedOut)));
    match expect_event(&h.events, |e| matches!(e, PortEvent::RequestTimedOut { .. })) {
        PortEvent::RequestTimedOut { request, .. } => assert_eq!(request, query),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.port.pending_request(), None);

    h.device.enqueue_read(b"!TEMP72;");
    let events = drain_events(&h.events, SETTLE);
    assert!(events
        .iter()
        .any(|e| matches!(e, PortEvent::DataReceived { .. })));
    assert!(!events
        .iter()
        .any(|e| matches!(e, PortEvent::ResponseReceived { .. })));
}

#[test]
fn test_timeout_starts_next_request() {
    let h = open_harness("REQ4");
    let slow = request(b"Q1;", "R1").with_timeout(Duration::from_millis(30));
    let slow_handle = h.port.submit(slow).unwrap();
    h.device.respond_to(b"Q2;", b"R2;");
    let next = h.port.submit(request(b"Q2;", "R2")).unwrap();

    assert_eq!(slow_handle.wait_timeout(WAIT), Some(Err(RequestError::TimedOut)));
    assert_eq!(next.wait_timeout(WAIT), Some(Ok(Some(b"R2;".to_vec()))));
}

#[test]
fn test_close_fails_outstanding_requests() {
    let h = open_harness("REQ5");
    let handles: Vec<_> = (0..4)
        .map(|i| {
            h.port
                .submit(request(format!("Q{};", i).as_bytes(), "R"))
                .unwrap()
        })
        .collect();

    h.port.close().unwrap();
    assert_eq!(h.port.state(), PortState::Closed);
    for handle in &handles {
        assert_eq!(handle.wait_timeout(WAIT), Some(Err(RequestError::PortClosed)));
    }

    let events = drain_events(&h.events, SETTLE);
    let closed_at = events
        .iter()
        .position(|e| matches!(e, PortEvent::Closed { .. }))
        .expect("closed event");
    let failures: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            PortEvent::RequestFailed { request, error, .. } => Some((request.clone(), error.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 4);
    assert!(failures.iter().all(|(_, e)| *e == RequestError::PortClosed));
    assert_eq!(&failures[0].0, handles[0].request());
    assert!(events
        .iter()
        .skip(closed_at)
        .any(|e| matches!(e, PortEvent::RequestFailed { .. })));

    assert_eq!(h.port.pending_request(), None);
    assert!(h.port.queued_requests().is_empty());
}

#[test]
fn test_cancel_queued_requests() {
    let h = open_harness("REQ6");
    let first = request(b"Q1;", "R1");
    let second = request(b"Q2;", "R2");
    let third = request(b"Q3;", "R3");
    h.port.submit(first.clone()).unwrap();
    let second_handle = h.port.submit(second.clone()).unwrap();
    let third_handle = h.port.submit(third.clone()).unwrap();

    assert!(h.port.cancel_queued(&second));
    assert!(!h.port.cancel_queued(&second));
    assert!(!h.port.cancel_queued(&first));
    assert_eq!(
        second_handle.wait_timeout(WAIT),
        Some(Err(RequestError::Cancelled))
    );

    assert_eq!(h.port.cancel_all_queued(), 1);
    assert_eq!(
        third_handle.wait_timeout(WAIT),
        Some(Err(RequestError::Cancelled))
    );
    assert_eq!(h.port.pending_request(), Some(first));
    assert_eq!(h.device.get_write_log(), vec![b"Q1;".to_vec()]);
}

#[test]
fn test_device_removal_fails_requests() {
    let h = open_harness("REQ7");
    let pending = h.port.submit(request(b"Q1;", "R1")).unwrap();
    let queued = h.port.submit(request(b"Q2;", "R2")).unwrap();

    h.device.disconnect();
    expect_event(&h.events, |e| matches!(e, PortEvent::Removed { .. }));
    assert_eq!(h.port.state(), PortState::Removed);
    assert_eq!(pending.wait_timeout(WAIT), Some(Err(RequestError::PortRemoved)));
    assert_eq!(queued.wait_timeout(WAIT), Some(Err(RequestError::PortRemoved)));

    h.device.reconnect();
    assert!(matches!(h.port.open(), Err(PortError::Removed)));
}

#[cfg(unix)]
#[test]
fn test_status_line_eio_counts_as_removal() {
    let h = open_harness("REQ7b");
    let pending = h.port.submit(request(b"Q1;", "R1")).unwrap();

    h.device.fail_pin_reads(libc::EIO);
    expect_event(&h.events, |e| matches!(e, PortEvent::Removed { .. }));
    assert_eq!(h.port.state(), PortState::Removed);
    assert_eq!(pending.wait_timeout(WAIT), Some(Err(RequestError::PortRemoved)));
}

#[cfg(unix)]
#[test]
fn test_other_status_line_errors_keep_port_open() {
    let h = open_harness("REQ7c");
    h.device.fail_pin_reads(libc::EBUSY);
    let events = drain_events(&h.events, SETTLE);
    assert!(!events.iter().any(|e| matches!(e, PortEvent::Removed { .. })));
    assert_eq!(h.port.state(), PortState::Open);
}

#[test]
fn test_mark_removed_fails_pending_request() {
    let h = open_harness("REQ8");
    let pending = h.port.submit(request(b"Q1;", "R1")).unwrap();

    h.port.mark_removed();
    assert_eq!(pending.wait_timeout(WAIT), Some(Err(RequestError::PortRemoved)));
    match expect_event(&h.events, |e| matches!(e, PortEvent::RequestFailed { .. })) {
        PortEvent::RequestFailed { error, .. } => assert_eq!(error, RequestError::PortRemoved),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_immediate_write_failure_is_returned() {
    let h = open_harness("REQ9");
    h.device.fail_next_write(5);

    let result = h.port.submit(request(b"Q1;", "R1"));
    assert!(matches!(result, Err(PortError::Io(_))));
    assert_eq!(h.port.pending_request(), None);

    match expect_event(&h.events, |e| matches!(e, PortEvent::Error(_))) {
        PortEvent::Error(report) => {
            assert_eq!(report.domain, POSIX_DOMAIN);
            assert_eq!(report.code, 5);
            assert_eq!(report.path, "REQ9");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_queued_write_failure_fails_that_request() {
    let h = open_harness("REQ10");
    let first = h.port.submit(request(b"Q1;", "R1")).unwrap();
    let second = h.port.submit(request(b"Q2;", "R2")).unwrap();
    let third = h.port.submit(Request::new(b"Q3;".to_vec())).unwrap();
    h.device.fail_next_write(5);

    h.device.enqueue_read(b"R1;");
    assert_eq!(first.wait_timeout(WAIT), Some(Ok(Some(b"R1;".to_vec()))));
    match second.wait_timeout(WAIT) {
        Some(Err(RequestError::Port(report))) => assert_eq!(report.code, 5),
        other => panic!("unexpected outcome {:?}", other),
    }
    // The queue keeps moving after a failed write.
    assert_eq!(third.wait_timeout(WAIT), Some(Ok(None)));
    expect_event(&h.events, |e| {
        matches!(e, PortEvent::RequestFailed { error: RequestError::Port(_), .. })
    });
}

#[test]
fn test_send_request_sync() {
    let h = open_harness("REQ11");
    h.device.respond_to(b"$TEMP?;", b"!TEMP72;");
    let temp = PacketDescriptor::delimited_str("!TEMP", ";", 10).unwrap();
    let query = Request::new(b"$TEMP?;".to_vec())
        .with_response(temp)
        .with_timeout(Duration::from_secs(1));
    assert_eq!(h.port.send_request_sync(query), Ok(Some(b"!TEMP72;".to_vec())));

    h.port.close().unwrap();
    match h.port.send_request_sync(Request::new(b"x".to_vec())) {
        Err(RequestError::Port(report)) => assert_eq!(report.domain, ENGINE_DOMAIN),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[test]
fn test_pin_changes_are_reported() {
    let h = open_harness("PIN0");
    assert_eq!(h.port.pins(), PinState::default());

    let pins = PinState {
        cts: true,
        dsr: false,
        dcd: true,
    };
    h.device.set_pins(pins);
    match expect_event(&h.events, |e| matches!(e, PortEvent::PinsChanged { .. })) {
        PortEvent::PinsChanged { pins: seen, .. } => assert_eq!(seen, pins),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(h.port.pins(), pins);

    h.port.close().unwrap();
    assert_eq!(h.port.pins(), PinState::default());
}

#[test]
fn test_open_failure_reports_error() {
    let h = harness("BUSY0");
    h.opener.fail_open("BUSY0", 16);

    assert!(matches!(h.port.open(), Err(PortError::Io(_))));
    assert_eq!(h.port.state(), PortState::Closed);
    match expect_event(&h.events, |e| matches!(e, PortEvent::Error(_))) {
        PortEvent::Error(report) => {
            assert_eq!(report.domain, POSIX_DOMAIN);
            assert_eq!(report.code, 16);
        }
        other => panic!("unexpected event {:?}", other),
    }

    h.opener.clear_failure("BUSY0");
    h.port.open().unwrap();
    assert!(h.port.is_open());
}

#[test]
fn test_output_lines_and_settings_follow_the_port() {
    let settings = PortSettings {
        baud_rate: 115200,
        rts: true,
        dtr: true,
        ..Default::default()
    };
    let h = harness_with_settings("LINES0", settings.clone());
    h.port.open().unwrap();
    assert!(h.device.rts());
    assert!(h.device.dtr());
    assert_eq!(h.device.applied_settings(), Some(settings));

    h.port.set_rts(false).unwrap();
    assert!(!h.device.rts());

    let slower = PortSettings {
        baud_rate: 9600,
        ..h.port.settings()
    };
    h.port.set_settings(slower.clone()).unwrap();
    assert_eq!(h.device.applied_settings(), Some(slower));

    let invalid = PortSettings {
        baud_rate: 250_000,
        ..Default::default()
    };
    assert!(matches!(h.port.set_settings(invalid), Err(PortError::Config(_))));
    assert_eq!(h.port.settings().baud_rate, 9600);
}

#[test]
fn test_close_restores_device() {
    let h = open_harness("RESTORE0");
    h.port.close().unwrap();
    assert_eq!(h.device.restore_count(), 1);

    h.port.open().unwrap();
    h.port.close().unwrap();
    assert_eq!(h.device.restore_count(), 2);
    assert_eq!(h.opener.open_count("RESTORE0"), 2);
}

#[test]
fn test_dropping_port_closes_device() {
    let h = open_harness("DROP0");
    let device = h.device.clone();
    drop(h);
    assert_eq!(device.restore_count(), 1);
}
