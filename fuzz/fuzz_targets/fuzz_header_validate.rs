//! Fuzz target: `OperationHeader::validate`
//!
//! Feeds arbitrary bytes to the frame-level checks and asserts that an
//! accepted header always describes a frame that fits the buffer.
//!
//! cargo fuzz run fuzz_header_validate

#![no_main]

use greybus_core::greybus::{HEADER_SIZE, OperationHeader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(hdr) = OperationHeader::validate(data) {
        let size = hdr.size as usize;
        assert!(size >= HEADER_SIZE, "accepted size below header length");
        assert!(size <= data.len(), "accepted size beyond buffer");
        assert_eq!(hdr.payload_size(), size - HEADER_SIZE);
        assert_eq!(OperationHeader::decode(&hdr.to_bytes()), Some(hdr));
    }
});
