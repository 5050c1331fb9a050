//! Arbitrary payloads from peers must decode to a color or a typed error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use shutter_core::{ColorSelection, ShutterError};

fuzz_target!(|data: &[u8]| {
    match ColorSelection::decode(data) {
        Ok(color) => assert_eq!(color.encode(), data),
        Err(ShutterError::UnknownColorToken(_)) => {}
        Err(other) => panic!("unexpected error: {other:?}"),
    }
});
