// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Selection policies for the merge loop.
//!
//! A [`Selector`] looks at the current candidate heads (one per feed with a
//! buffered block) and picks which one to emit next, or returns `None` when no
//! candidate is eligible yet. Any `Fn(&[Block<T>]) -> Option<usize>` closure
//! is a selector.
//!
//! Candidates arrive sorted by feed key. Returning an index outside the slice
//! is a contract violation and stops the merge.

use crate::feed::{Block, FeedKey};
use parking_lot::Mutex;

/// Pluggable tie-breaking policy.
pub trait Selector<T>: Send + Sync {
    /// Choose a candidate index, or `None` if nothing is eligible yet.
    ///
    /// Must not assume the slice is non-empty.
    fn select(&self, candidates: &[Block<T>]) -> Option<usize>;
}

impl<T, F> Selector<T> for F
where
    F: Fn(&[Block<T>]) -> Option<usize> + Send + Sync,
{
    fn select(&self, candidates: &[Block<T>]) -> Option<usize> {
        self(candidates)
    }
}

/// Emit the head with the lowest `seq`; ties go to the lowest feed key.
#[derive(Debug, Clone, Copy, Default)]
pub struct LowestSeq;

impl<T> Selector<T> for LowestSeq {
    fn select(&self, candidates: &[Block<T>]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, block)| (block.seq, block.feed_key))
            .map(|(i, _)| i)
    }
}

/// Rotate across feeds: after emitting from one feed, prefer the next feed
/// key (wrapping) that has a ready head.
///
/// Feeds without a ready head are skipped, so a slow feed never holds up the
/// others.
#[derive(Debug, Default)]
pub struct RoundRobin {
    last: Mutex<Option<FeedKey>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the feed chosen most recently.
    pub fn last(&self) -> Option<FeedKey> {
        *self.last.lock()
    }
}

impl<T> Selector<T> for RoundRobin {
    fn select(&self, candidates: &[Block<T>]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let mut last = self.last.lock();
        let after = |block: &Block<T>| match *last {
            Some(prev) => block.feed_key > prev,
            None => true,
        };

        // Smallest key after the previous pick, else wrap to the smallest key.
        let pick = candidates
            .iter()
            .enumerate()
            .filter(|(_, block)| after(block))
            .min_by_key(|(_, block)| block.feed_key)
            .or_else(|| {
                candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, block)| block.feed_key)
            })
            .map(|(i, block)| (i, block.feed_key));

        let (index, key) = pick?;
        *last = Some(key);
        Some(index)
    }
}
