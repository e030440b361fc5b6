//! Fuzz target: `Greybus::on_receive`
//!
//! The first input byte picks a cport (including out-of-range ones), the
//! rest is handed to the receive path as a frame. One engine is shared
//! across iterations so the workers, FIFOs and pending lists see a long
//! stream of hostile traffic.
//!
//! Invariants checked:
//! - No panics, on the receive path or on any worker
//! - Out-of-range cports are always rejected
//!
//! cargo fuzz run fuzz_on_receive

#![no_main]

use std::sync::{Arc, OnceLock};

use greybus_core::greybus::NullTransport;
use greybus_core::protocols::control;
use greybus_core::{CportDriver, Error, Greybus, GreybusConfig, OpResult};
use libfuzzer_sys::fuzz_target;

const CPORTS: u16 = 4;

fn engine() -> &'static Greybus {
    static ENGINE: OnceLock<Greybus> = OnceLock::new();
    ENGINE.get_or_init(|| {
        let gb = Greybus::init(Arc::new(NullTransport::new(CPORTS)), GreybusConfig::default())
            .unwrap();
        gb.register_driver(0, control::driver(vec![1, 2, 3, 4])).unwrap();
        gb.register_driver(
            1,
            CportDriver::new("echo")
                .handler(0x01, |gb, op| {
                    let _ = gb.send_response(op, OpResult::Success);
                    OpResult::Success
                })
                .fast_handler(0x02, |_, frame| assert!(frame.len() >= 8)),
        )
        .unwrap();
        gb
    })
}

fuzz_target!(|data: &[u8]| {
    let Some((&selector, frame)) = data.split_first() else {
        return;
    };
    let cport = u16::from(selector % (CPORTS as u8 + 1));
    let gb = engine();

    match gb.on_receive(cport, frame) {
        Err(Error::InvalidArgument) | Err(Error::OutOfMemory) | Ok(()) => {}
        Err(e) => panic!("unexpected receive error: {e}"),
    }
    if cport >= CPORTS {
        assert_eq!(gb.on_receive(cport, frame), Err(Error::InvalidArgument));
    }
    let _ = gb.reap_expired(cport);
});
