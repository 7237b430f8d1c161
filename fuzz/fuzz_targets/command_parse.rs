//! Fuzz target for inbound command parsing.
//!
//! Anything can land on the command topic; parsing must never panic.

#![no_main]

use bluehub::commands::Command;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Command>(data);
});
