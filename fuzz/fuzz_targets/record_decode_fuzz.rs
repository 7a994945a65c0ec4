//! Fuzz target for the cache record decoder.
//!
//! Arbitrary bytes must never panic the decoder. Anything that decodes must
//! survive an encode/decode cycle unchanged.
//!
//! Run with: cargo +nightly fuzz run record_decode_fuzz -- -max_total_time=60

#![no_main]

use kiln_storage::codec::{decode, encode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(record) = decode(data) else {
        return;
    };

    let bytes = encode(&record).expect("decoded record should re-encode");
    let again = decode(&bytes).expect("re-encoded record should decode");
    assert_eq!(record, again, "record changed across encode/decode");
});
