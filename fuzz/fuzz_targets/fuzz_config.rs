//! Fuzz target for configuration parsing.
//!
//! Tests that feed key parsing and `MergeConfig` deserialization/validation
//! never panic on arbitrary input.

#![no_main]

use feed_merge::{FeedKey, MergeConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Should never panic
        if let Ok(key) = s.parse::<FeedKey>() {
            assert_eq!(key.to_string().parse::<FeedKey>().ok(), Some(key));
        }
    }

    if let Ok(config) = serde_json::from_slice::<MergeConfig>(data) {
        let _ = config.validate();
        let _ = config.stall_timeout_duration();
        let _ = config.close_timeout_duration();
    }
});
