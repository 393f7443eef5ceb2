//! Fuzz target for the stock selectors.
//!
//! `LowestSeq` and `RoundRobin` must always return an in-range index for a
//! non-empty candidate set, and `None` for an empty one.

#![no_main]

use feed_merge::{Block, FeedKey, LowestSeq, RoundRobin, Selector};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|rounds: Vec<Vec<(u8, u64)>>| {
    let round_robin = RoundRobin::new();

    for round in rounds {
        let candidates: Vec<Block<()>> = round
            .into_iter()
            .map(|(k, seq)| Block {
                feed_key: FeedKey::from_bytes([k; 32]),
                seq,
                data: (),
            })
            .collect();

        for choice in [LowestSeq.select(&candidates[..]), round_robin.select(&candidates[..])] {
            match choice {
                Some(index) => assert!(index < candidates.len()),
                None => assert!(candidates.is_empty()),
            }
        }
    }
});
