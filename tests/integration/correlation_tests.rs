//! Outbound requests, response correlation and timeouts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use greybus_core::greybus::{Callback, TX_PENDING_DEPTH};
use greybus_core::{CportDriver, Error, GreybusConfig, OpResult, Operation, TransportError};

use crate::mock_transport::{engine_with, link, request_frame, wait_until};

fn short_timeout() -> GreybusConfig {
    GreybusConfig {
        request_timeout_ms: 20,
        ..GreybusConfig::default()
    }
}

/// Records the result each completion callback observed.
fn recorder() -> (Arc<Mutex<Vec<Option<OpResult>>>>, Callback) {
    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = results.clone();
    let cb: Callback = Box::new(move |op: &Operation| {
        sink.lock().unwrap().push(op.result());
    });
    (results, cb)
}

#[test]
fn sync_request_links_the_response() {
    let l = link(2, GreybusConfig::default());
    l.host.register_driver(1, CportDriver::new("host")).unwrap();
    l.module
        .register_driver(
            1,
            CportDriver::new("module").handler(0x05, |_, op| {
                match op.alloc_response(2, |p| p.copy_from_slice(&[0xde, 0xad])) {
                    Ok(()) => OpResult::Success,
                    Err(e) => e.into(),
                }
            }),
        )
        .unwrap();

    let op = l.host.create_operation(1, 0x05, 0).unwrap();
    assert_eq!(l.host.send_request_sync(&op), Ok(OpResult::Success));

    assert_ne!(op.id(), 0);
    let resp = op.response().unwrap();
    assert_eq!(resp.id(), op.id());
    assert_eq!(resp.op_type(), 0x85);
    assert_eq!(resp.request_payload(), vec![0xde, 0xad]);
    assert_eq!(l.host.pending_count(1).unwrap(), 0);
    assert!(wait_until(|| l.host.stats(1).unwrap().responses_matched == 1));

    // The response lives exactly as long as the request that links it.
    let weak = resp.downgrade();
    drop(resp);
    assert!(!weak.is_released());
    op.destroy();
    assert!(wait_until(|| weak.is_released()));
}

#[test]
fn remote_failure_result_is_delivered() {
    let l = link(1, GreybusConfig::default());
    l.host.register_driver(0, CportDriver::new("host")).unwrap();
    l.module
        .register_driver(0, CportDriver::new("module").handler(0x06, |_, _| OpResult::Retry))
        .unwrap();

    let op = l.host.create_operation(0, 0x06, 0).unwrap();
    assert_eq!(l.host.send_request_sync(&op), Ok(OpResult::Retry));
}

#[test]
fn async_callback_fires_once_with_response() {
    let l = link(1, GreybusConfig::default());
    l.host.register_driver(0, CportDriver::new("host")).unwrap();
    l.module
        .register_driver(0, CportDriver::new("module").handler(0x07, |_, _| OpResult::Success))
        .unwrap();

    let (results, cb) = recorder();
    let op = l.host.create_operation(0, 0x07, 4).unwrap();
    l.host.send_request(&op, Some(cb), true).unwrap();

    assert!(wait_until(|| !results.lock().unwrap().is_empty()));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(*results.lock().unwrap(), vec![Some(OpResult::Success)]);
}

#[test]
fn request_ids_are_unique_and_non_zero() {
    let (gb, tx) = engine_with(1, GreybusConfig::default());
    for _ in 0..5 {
        let op = gb.create_operation(0, 0x01, 0).unwrap();
        gb.send_request(&op, None, true).unwrap();
    }
    let mut ids: Vec<u16> = tx.sent_headers().iter().map(|h| h.id).collect();
    assert!(ids.iter().all(|&id| id != 0));
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert_eq!(gb.pending_count(0).unwrap(), 5);
}

#[test]
fn fire_and_forget_is_sent_with_id_zero() {
    let l = link(1, GreybusConfig::default());
    let got = Arc::new(Mutex::new(None));
    let sink = got.clone();
    l.module
        .register_driver(
            0,
            CportDriver::new("module").handler(0x10, move |_, op| {
                *sink.lock().unwrap() = Some(op.id());
                OpResult::Success
            }),
        )
        .unwrap();

    let op = l.host.create_operation(0, 0x10, 0).unwrap();
    l.host.send_request(&op, None, false).unwrap();

    assert!(wait_until(|| got.lock().unwrap().is_some()));
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(*got.lock().unwrap(), Some(0));
    assert_eq!(l.host.pending_count(0).unwrap(), 0);
    assert!(l.module_tx.sent().is_empty(), "no response for id 0");
    assert_eq!(op.ref_count(), 1);
}

#[test]
fn unanswered_request_is_reaped_with_timeout() {
    let (gb, _tx) = engine_with(1, short_timeout());
    gb.register_driver(0, CportDriver::new("host")).unwrap();

    let (results, cb) = recorder();
    let op = gb.create_operation(0, 0x01, 0).unwrap();
    gb.send_request(&op, Some(cb), true).unwrap();
    assert_eq!(gb.pending_count(0).unwrap(), 1);
    assert_eq!(op.ref_count(), 2);

    // Not expired yet.
    assert_eq!(gb.reap_expired(0).unwrap(), 0);

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(gb.reap_expired(0).unwrap(), 1);
    assert_eq!(*results.lock().unwrap(), vec![Some(OpResult::Timeout)]);
    assert_eq!(op.result(), Some(OpResult::Timeout));
    assert_eq!(gb.pending_count(0).unwrap(), 0);
    assert_eq!(op.ref_count(), 1);
    assert_eq!(gb.stats(0).unwrap().timeouts, 1);
}

#[test]
fn inbound_response_reaps_expired_requests() {
    let (gb, _tx) = engine_with(1, short_timeout());
    gb.register_driver(0, CportDriver::new("host")).unwrap();

    let (results, cb) = recorder();
    let stale = gb.create_operation(0, 0x01, 0).unwrap();
    gb.send_request(&stale, Some(cb), true).unwrap();
    std::thread::sleep(Duration::from_millis(40));

    // A response nobody asked for still triggers the scan.
    gb.on_receive(0, &request_frame(0x81, stale.id().wrapping_add(100), &[]))
        .unwrap();

    assert!(wait_until(|| !results.lock().unwrap().is_empty()));
    assert_eq!(*results.lock().unwrap(), vec![Some(OpResult::Timeout)]);
    assert_eq!(gb.pending_count(0).unwrap(), 0);
    assert_eq!(gb.stats(0).unwrap().responses_matched, 0);
}

#[test]
fn expired_entry_loses_to_timeout_even_when_its_response_arrives() {
    let (gb, _tx) = engine_with(1, short_timeout());
    gb.register_driver(0, CportDriver::new("host")).unwrap();

    let (results, cb) = recorder();
    let op = gb.create_operation(0, 0x03, 0).unwrap();
    gb.send_request(&op, Some(cb), true).unwrap();
    std::thread::sleep(Duration::from_millis(40));

    gb.on_receive(0, &request_frame(0x83, op.id(), &[])).unwrap();

    assert!(wait_until(|| !results.lock().unwrap().is_empty()));
    assert_eq!(*results.lock().unwrap(), vec![Some(OpResult::Timeout)]);
    assert!(op.response().is_none());
}

#[test]
fn sync_request_unblocks_on_timeout() {
    let (gb, _tx) = engine_with(1, short_timeout());
    gb.register_driver(0, CportDriver::new("host")).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reaper = {
        let gb = gb.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
                let _ = gb.reap_expired(0);
            }
        })
    };

    let op = gb.create_operation(0, 0x01, 0).unwrap();
    assert_eq!(gb.send_request_sync(&op), Ok(OpResult::Timeout));
    done.store(true, Ordering::SeqCst);
    reaper.join().unwrap();
}

#[test]
fn failed_send_leaves_nothing_pending() {
    let (gb, tx) = engine_with(1, GreybusConfig::default());
    tx.fail_sends(true);

    let (results, cb) = recorder();
    let op = gb.create_operation(0, 0x01, 0).unwrap();
    assert_eq!(
        gb.send_request(&op, Some(cb), true),
        Err(Error::Transport(TransportError::Io("injected failure")))
    );
    assert_eq!(gb.pending_count(0).unwrap(), 0);
    assert_eq!(op.ref_count(), 1);
    assert!(op.sent_at().is_none());
    assert!(results.lock().unwrap().is_empty());
    assert_eq!(gb.stats(0).unwrap().tx_frames, 0);
}

#[test]
fn full_pending_list_rejects_request() {
    let (gb, tx) = engine_with(1, GreybusConfig::default());
    let ops: Vec<_> = (0..TX_PENDING_DEPTH)
        .map(|_| {
            let op = gb.create_operation(0, 0x01, 0).unwrap();
            gb.send_request(&op, None, true).unwrap();
            op
        })
        .collect();

    let extra = gb.create_operation(0, 0x01, 0).unwrap();
    assert_eq!(gb.send_request(&extra, None, true), Err(Error::OutOfMemory));
    assert_eq!(tx.sent().len(), ops.len());
    assert_eq!(extra.ref_count(), 1);
}

#[test]
fn failed_response_send_can_be_retried() {
    let (gb, tx) = engine_with(1, GreybusConfig::default());
    let op = gb.create_operation(0, 0x01, 0).unwrap();

    tx.fail_sends(true);
    assert!(gb.send_response(&op, OpResult::Success).is_err());
    assert!(!op.has_responded());

    tx.fail_sends(false);
    gb.send_response(&op, OpResult::Success).unwrap();
    assert!(op.has_responded());
    assert_eq!(gb.send_response(&op, OpResult::Success), Err(Error::InvalidState));
    assert_eq!(tx.sent().len(), 1);
}
