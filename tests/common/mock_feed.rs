//! Flaky feed for failure-path testing.
//!
//! Wraps a [`MemoryFeed`] and injects one read error before each configured
//! seq. Counts cursor opens and closes so tests can assert cursors are torn
//! down.

use feed_merge::{Block, BoxFuture, Feed, FeedCursor, FeedError, FeedKey, FeedResult, MemoryFeed};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Feed that fails once before selected seqs.
///
/// # Example
/// ```rust,ignore
/// let feed = FlakyFeed::new(key(1));
/// feed.fail_before(2);
/// feed.append_many(0..5);
///
/// // A cursor yields seq 0, seq 1, Err(Read), seq 2, ...
/// ```
pub struct FlakyFeed {
    inner: MemoryFeed<u32>,
    fail_before: Arc<Mutex<HashSet<u64>>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl FlakyFeed {
    pub fn new(key: FeedKey) -> Self {
        Self {
            inner: MemoryFeed::new(key),
            fail_before: Arc::new(Mutex::new(HashSet::new())),
            opens: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Inject one read error before `seq` is delivered.
    pub fn fail_before(&self, seq: u64) {
        self.fail_before.lock().insert(seq);
    }

    pub fn append_many(&self, items: impl IntoIterator<Item = u32>) {
        self.inner.append_many(items);
    }

    /// Close the underlying feed.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Number of cursors opened.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of cursors closed by their reader.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Feed<u32> for FlakyFeed {
    fn key(&self) -> FeedKey {
        self.inner.key()
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }

    fn open_cursor(&self, start: u64) -> FeedResult<Box<dyn FeedCursor<u32>>> {
        let inner = self.inner.open_cursor(start)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FlakyCursor {
            inner,
            next_seq: start,
            fail_before: Arc::clone(&self.fail_before),
            closes: Arc::clone(&self.closes),
        }))
    }
}

struct FlakyCursor {
    inner: Box<dyn FeedCursor<u32>>,
    next_seq: u64,
    fail_before: Arc<Mutex<HashSet<u64>>>,
    closes: Arc<AtomicUsize>,
}

impl FeedCursor<u32> for FlakyCursor {
    fn next(&mut self) -> BoxFuture<'_, Block<u32>> {
        Box::pin(async move {
            if self.fail_before.lock().remove(&self.next_seq) {
                return Err(FeedError::Read(format!("injected failure before seq {}", self.next_seq)));
            }
            let block = self.inner.next().await?;
            self.next_seq = block.seq + 1;
            Ok(block)
        })
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close();
    }
}
