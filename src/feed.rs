// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Feed collaborator traits and the in-memory feed.
//!
//! The merge engine never stores or replicates blocks itself. It consumes a
//! [`Feed`] through a live, demand-paced [`FeedCursor`]:
//!
//! - `open_cursor(start)` delivers blocks from `start` onward, including blocks
//!   appended after the cursor was opened (tailing mode).
//! - A cursor produces nothing until `next()` is awaited, so calling `next()`
//!   is the acknowledgement that the previous block was consumed.
//! - Closing the feed resolves any pending `next()` with [`FeedError::Closed`].
//!
//! # Example
//!
//! ```rust,no_run
//! use feed_merge::feed::{Feed, FeedCursor, FeedKey, MemoryFeed};
//!
//! # async fn example() -> feed_merge::FeedResult<()> {
//! let feed = MemoryFeed::new(FeedKey::from_bytes([1; 32]));
//! feed.append(b"first".to_vec());
//!
//! let mut cursor = feed.open_cursor(0)?;
//! let block = cursor.next().await?;
//! assert_eq!(block.seq, 0);
//! # Ok(())
//! # }
//! ```

use crate::error::{FeedError, FeedResult};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Type alias for boxed feed futures (keeps trait signatures readable).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = FeedResult<T>> + Send + 'a>>;

/// Stable identity of a feed (a 32-byte public key).
///
/// Displayed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey([u8; 32]);

impl FeedKey {
    /// Create a key from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedKey({})", self.short())
    }
}

impl FromStr for FeedKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for FeedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FeedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One record at position `seq` within one feed. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block<T> {
    /// Feed the block belongs to
    pub feed_key: FeedKey,
    /// Position within the feed (contiguous from 0)
    pub seq: u64,
    /// Payload
    pub data: T,
}

/// A live, demand-paced read cursor over one feed.
pub trait FeedCursor<T>: Send {
    /// Resolve with the next block in `seq` order, waiting for it to be
    /// appended if necessary.
    ///
    /// Returns [`FeedError::Closed`] once the cursor or its feed is closed.
    fn next(&mut self) -> BoxFuture<'_, Block<T>>;

    /// Interrupt delivery. Subsequent `next()` calls resolve with `Closed`.
    fn close(&mut self);
}

/// An append-only, single-writer, monotonically growing sequence of blocks.
///
/// Implementations may be local (written in-process) or replicated from
/// remote peers. A feed may be shared read-only across subsystems.
pub trait Feed<T>: Send + Sync + 'static {
    /// Stable identity of this feed.
    fn key(&self) -> FeedKey;

    /// Number of blocks currently available.
    fn len(&self) -> u64;

    /// Check if no blocks are available yet.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a live cursor starting at `start`.
    ///
    /// Fails with [`FeedError::Closed`] if the feed is already closed.
    fn open_cursor(&self, start: u64) -> FeedResult<Box<dyn FeedCursor<T>>>;
}

struct MemoryFeedInner<T> {
    key: FeedKey,
    blocks: RwLock<Vec<T>>,
    closed: AtomicBool,
    appended: Notify,
}

/// In-process feed backed by a vector.
///
/// Appends wake every open cursor. Cloning is cheap and shares the log.
pub struct MemoryFeed<T> {
    inner: Arc<MemoryFeedInner<T>>,
}

impl<T> Clone for MemoryFeed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> MemoryFeed<T> {
    /// Create an empty feed.
    pub fn new(key: FeedKey) -> Self {
        Self {
            inner: Arc::new(MemoryFeedInner {
                key,
                blocks: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                appended: Notify::new(),
            }),
        }
    }

    /// Append one block and return its `seq`.
    ///
    /// Appends to a closed feed are dropped; the returned `seq` is still the
    /// position the block would have had.
    pub fn append(&self, data: T) -> u64 {
        let seq = {
            let mut blocks = self.inner.blocks.write();
            let seq = blocks.len() as u64;
            if !self.is_closed() {
                blocks.push(data);
            }
            seq
        };
        self.inner.appended.notify_waiters();
        seq
    }

    /// Append several blocks, returning the `seq` of the last one.
    pub fn append_many(&self, items: impl IntoIterator<Item = T>) -> Option<u64> {
        let last = {
            let mut blocks = self.inner.blocks.write();
            if self.is_closed() {
                return None;
            }
            let before = blocks.len();
            blocks.extend(items);
            if blocks.len() == before {
                None
            } else {
                Some(blocks.len() as u64 - 1)
            }
        };
        self.inner.appended.notify_waiters();
        last
    }

    /// Close the feed. Pending cursor reads resolve with [`FeedError::Closed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(feed_key = %self.inner.key.short(), "Memory feed closed");
        }
        self.inner.appended.notify_waiters();
    }

    /// Check if the feed has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Read a block without opening a cursor.
    pub fn get(&self, seq: u64) -> Option<Block<T>> {
        let blocks = self.inner.blocks.read();
        let index = usize::try_from(seq).ok()?;
        blocks.get(index).map(|data| Block {
            feed_key: self.inner.key,
            seq,
            data: data.clone(),
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Feed<T> for MemoryFeed<T> {
    fn key(&self) -> FeedKey {
        self.inner.key
    }

    fn len(&self) -> u64 {
        self.inner.blocks.read().len() as u64
    }

    fn open_cursor(&self, start: u64) -> FeedResult<Box<dyn FeedCursor<T>>> {
        if self.is_closed() {
            return Err(FeedError::Closed);
        }
        Ok(Box::new(MemoryCursor {
            inner: Arc::clone(&self.inner),
            index: start,
            closed: false,
        }))
    }
}

struct MemoryCursor<T> {
    inner: Arc<MemoryFeedInner<T>>,
    index: u64,
    closed: bool,
}

impl<T: Clone + Send + Sync + 'static> FeedCursor<T> for MemoryCursor<T> {
    fn next(&mut self) -> BoxFuture<'_, Block<T>> {
        Box::pin(async move {
            loop {
                // Register before checking so an append in between is not lost.
                let appended = self.inner.appended.notified();
                tokio::pin!(appended);
                appended.as_mut().enable();

                if self.closed || self.inner.closed.load(Ordering::Acquire) {
                    return Err(FeedError::Closed);
                }

                let data = {
                    let blocks = self.inner.blocks.read();
                    usize::try_from(self.index)
                        .ok()
                        .and_then(|index| blocks.get(index))
                        .cloned()
                };
                if let Some(data) = data {
                    let block = Block {
                        feed_key: self.inner.key,
                        seq: self.index,
                        data,
                    };
                    self.index += 1;
                    return Ok(block);
                }

                appended.await;
            }
        })
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
