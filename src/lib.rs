// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Feed Merge
//!
//! The ordered multi-feed merge engine of a replicated append-only-log store.
//!
//! Many independently-growing feeds (written locally or replicated from peers)
//! are combined into one ordered stream of blocks for a downstream state
//! machine. Feeds may be added while the merge is running.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              feed-merge                                  │
//! │                                                                          │
//! │  ┌────────┐   ┌────────────────┐                                         │
//! │  │ Feed A │──►│ FeedQueue (≤1) │──┐                                      │
//! │  └────────┘   └────────────────┘  │   ┌───────────────┐   ┌──────────┐   │
//! │  ┌────────┐   ┌────────────────┐  ├──►│ MergeIterator │──►│ consumer │   │
//! │  │ Feed B │──►│ FeedQueue (≤1) │──┤   │  + Selector   │   └──────────┘   │
//! │  └────────┘   └────────────────┘  │   └───────┬───────┘                  │
//! │  ┌────────┐   ┌────────────────┐  │           │ stalled(candidates)      │
//! │  │ Feed C │──►│ FeedQueue (≤1) │──┘           ▼                          │
//! │  └────────┘   └────────────────┘        broadcast subscribers            │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - Each [`FeedQueue`] holds at most one block; the feed cursor is not read
//!   again until that block is popped.
//! - The [`MergeIterator`] asks a [`Selector`] which buffered head to emit next.
//!   When nothing is eligible it sleeps on a [`Trigger`] until a head changes,
//!   a feed is added, `stop()` is called, or the stall timer fires.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use feed_merge::{Block, FeedKey, MemoryFeed, MergeConfig, MergeIterator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> feed_merge::Result<()> {
//!     let selector = |candidates: &[Block<String>]| -> Option<usize> {
//!         if candidates.is_empty() { None } else { Some(0) }
//!     };
//!     let merge = Arc::new(MergeIterator::new(selector, MergeConfig::default())?);
//!
//!     let feed = Arc::new(MemoryFeed::new(FeedKey::from_bytes([1; 32])));
//!     feed.append("hello".to_string());
//!
//!     merge.add_feed(feed.clone(), None).await?;
//!     merge.start().await?;
//!
//!     if let Some(block) = merge.next().await {
//!         let block = block?;
//!         println!("{} #{}: {}", block.feed_key, block.seq, block.data);
//!     }
//!     merge.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod merge;
pub mod metrics;
pub mod queue;
pub mod selector;
pub mod stall;
pub mod trigger;

// Re-exports for convenience
pub use config::MergeConfig;
pub use error::{FeedError, FeedResult, MergeError, Result};
pub use feed::{Block, BoxFuture, Feed, FeedCursor, FeedKey, MemoryFeed};
pub use merge::{IteratorState, MergeIterator, StallEvent};
pub use queue::FeedQueue;
pub use selector::{LowestSeq, RoundRobin, Selector};
pub use stall::StallTimer;
pub use trigger::Trigger;
