// Copyright (c) 2026 Amunchain
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use vcs_gossip_core::peers::normalize;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Must never panic, and must be idempotent whenever it succeeds once.
        if let Ok(once) = normalize(s) {
            let _ = normalize(&once);
        }
    }
});
