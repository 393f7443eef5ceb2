//! Shared test utilities for integration, chaos and property tests.
//!
//! This module provides:
//! - A flaky feed that injects read errors and counts cursor lifecycle calls
//! - Feed key and memory feed helpers
//! - Drain helpers with bounded waits

// Not every test binary uses every helper.
#![allow(dead_code)]

pub mod mock_feed;

pub use mock_feed::*;

use feed_merge::{Block, FeedKey, MemoryFeed, MergeIterator};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in the test suites.
pub const WAIT: Duration = Duration::from_secs(5);

/// Deterministic feed key from one byte.
pub fn key(n: u8) -> FeedKey {
    FeedKey::from_bytes([n; 32])
}

/// Memory feed holding `count` blocks whose data equals their seq.
pub fn memory_feed(n: u8, count: u32) -> Arc<MemoryFeed<u32>> {
    let feed = Arc::new(MemoryFeed::new(key(n)));
    feed.append_many(0..count);
    feed
}

/// Pull `count` blocks, failing the test on errors or if the merge hangs.
///
/// Stops early if the sequence ends.
pub async fn drain<T>(merge: &MergeIterator<T>, count: usize) -> Vec<Block<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let mut blocks = Vec::with_capacity(count);
    while blocks.len() < count {
        let item = tokio::time::timeout(WAIT, merge.next())
            .await
            .unwrap_or_else(|_| panic!("merge hung after {} blocks", blocks.len()));
        match item {
            Some(Ok(block)) => blocks.push(block),
            Some(Err(e)) => panic!("unexpected merge error: {}", e),
            None => break,
        }
    }
    blocks
}

/// The seqs emitted for one feed, in emission order.
pub fn seqs_for<T>(blocks: &[Block<T>], feed_key: FeedKey) -> Vec<u64> {
    blocks
        .iter()
        .filter(|block| block.feed_key == feed_key)
        .map(|block| block.seq)
        .collect()
}

/// Assert a feed's blocks were emitted exactly once each, as `0..count`.
pub fn assert_gapless<T>(blocks: &[Block<T>], feed_key: FeedKey, count: u64) {
    let seqs = seqs_for(blocks, feed_key);
    let expected: Vec<u64> = (0..count).collect();
    assert_eq!(seqs, expected, "feed {} delivered out of order or with gaps", feed_key.short());
}
