#![no_main]

use libfuzzer_sys::fuzz_target;
use vcs_gossip_core::oplog::{verify_operation, Operation};

fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(op) = serde_json::from_str::<Operation>(line) else {
        return;
    };
    // Must never panic, regardless of how malformed the parsed operation is.
    let _ = verify_operation(&op);
});
