//! Fuzz target for the flat fragment parser.
//!
//! Tests:
//! - Arbitrary bytes never panic the parser or the handler
//! - A failed batch leaves exactly the fragments before the bad offset queued
//! - Re-encoding the parsed prefix reproduces the input bytes

#![no_main]

use libfuzzer_sys::fuzz_target;
use rust_evb::fragment::{encode_fragments, whole_fragment_prefix, FlatFragments};
use rust_evb::handler::FragmentHandler;

fuzz_target!(|data: &[u8]| {
    let mut parsed = Vec::new();
    let mut iter = FlatFragments::new(data);
    let mut failed = false;
    for fragment in iter.by_ref() {
        match fragment {
            Ok(fragment) => parsed.push(fragment),
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    let prefix = iter.offset();
    assert_eq!(&encode_fragments(&parsed)[..], &data[..prefix]);
    assert_eq!(whole_fragment_prefix(data, data.len()), prefix);

    let mut handler = FragmentHandler::default();
    let result = handler.add_fragments(data);
    assert_eq!(result.is_err(), failed);
    if failed {
        assert_eq!(handler.statistics().total_queued_fragments, parsed.len());
    }
    handler.flush();
    assert_eq!(handler.statistics().total_queued_fragments, 0);
});
