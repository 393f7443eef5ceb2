// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered multi-feed merge.
//!
//! The [`MergeIterator`] owns one [`FeedQueue`] per tracked feed and turns
//! their buffered heads into a single lazy sequence of blocks:
//!
//! 1. Surface any pending feed read error as an `Err` item
//! 2. Build the candidate set (every open queue with a buffered head)
//! 3. Ask the [`Selector`] for an index
//! 4. On a choice: disarm the stall timer, pop the winner, yield it
//! 5. On no choice: arm the stall timer and sleep on the wake trigger
//!
//! # Wake Conditions
//!
//! The idle loop sleeps on one [`Trigger`], woken when a queue's head changes,
//! a feed is added or removed, or the iterator starts or stops. The only timed
//! wake is the stall timer.
//!
//! # Failure Handling
//!
//! - A queue closing between selection and pop is a benign race: it is
//!   logged and selection restarts.
//! - Feed read errors are yielded as [`MergeError::FeedRead`]; the merge keeps
//!   going and the caller decides whether to drop the feed.
//! - A selector returning an out-of-range index stops the iterator: the error
//!   is yielded once, then the sequence ends.

mod types;

pub use types::{IteratorState, StallEvent};

use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::feed::{Block, Feed, FeedKey};
use crate::metrics;
use crate::queue::FeedQueue;
use crate::selector::Selector;
use crate::stall::StallTimer;
use crate::trigger::Trigger;
use futures::Stream;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Merges blocks from a dynamic set of feeds into one ordered sequence.
///
/// Share it behind an `Arc`: feeds may be added from any task while another
/// task drives [`next()`](Self::next). Concurrent `next()` callers are
/// serialized.
pub struct MergeIterator<T> {
    /// Tie-breaking policy
    selector: Box<dyn Selector<T>>,

    config: MergeConfig,
    stall_timeout: Duration,
    close_timeout: Duration,

    /// Tracked queues, ordered by key so candidate order is deterministic
    queues: RwLock<BTreeMap<FeedKey, Arc<FeedQueue<T>>>>,

    /// Wakes the idle merge loop
    wake: Arc<Trigger>,

    /// Iterator state (broadcast to watchers)
    state_tx: watch::Sender<IteratorState>,
    state_rx: watch::Receiver<IteratorState>,

    /// Stall notifications
    stalled_tx: broadcast::Sender<StallEvent<T>>,

    /// Stall timer, also the single-consumer guard for `next()`
    stall: Mutex<StallTimer>,
}

impl<T: Clone + Send + Sync + 'static> MergeIterator<T> {
    /// Create a merge iterator in the `Created` state.
    ///
    /// Fails with [`MergeError::Config`] if `config` does not validate.
    pub fn new<S>(selector: S, config: MergeConfig) -> Result<Self>
    where
        S: Selector<T> + 'static,
    {
        config.validate()?;

        let stall_timeout = config.stall_timeout_duration();
        let close_timeout = config.close_timeout_duration();
        let (state_tx, state_rx) = watch::channel(IteratorState::Created);
        let (stalled_tx, _) = broadcast::channel(config.stall_channel_capacity);

        Ok(Self {
            selector: Box::new(selector),
            config,
            stall_timeout,
            close_timeout,
            queues: RwLock::new(BTreeMap::new()),
            wake: Arc::new(Trigger::new()),
            state_tx,
            state_rx,
            stalled_tx,
            stall: Mutex::new(StallTimer::new(stall_timeout)),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Get current iterator state.
    pub fn state(&self) -> IteratorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<IteratorState> {
        self.state_rx.clone()
    }

    /// Check if the iterator is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), IteratorState::Running)
    }

    /// Subscribe to stall notifications.
    ///
    /// Slow subscribers skip ahead (`RecvError::Lagged`) rather than block the
    /// merge loop.
    pub fn subscribe_stalled(&self) -> broadcast::Receiver<StallEvent<T>> {
        self.stalled_tx.subscribe()
    }

    /// Check if a feed is tracked.
    pub fn has_feed(&self, key: &FeedKey) -> bool {
        self.queues.read().contains_key(key)
    }

    /// Keys of all tracked feeds, in key order.
    pub fn feeds(&self) -> Vec<FeedKey> {
        self.queues.read().keys().copied().collect()
    }

    /// Number of tracked feeds.
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Check if no feeds are tracked.
    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }

    /// `seq` of the next block the given feed's queue will produce.
    pub fn position(&self, key: &FeedKey) -> Option<u64> {
        self.queues.read().get(key).and_then(|queue| queue.index())
    }

    /// Track a feed and open its queue.
    ///
    /// The queue starts at `start` if given, otherwise at the configured
    /// `start_positions` entry for the feed, otherwise at 0. A feed that is
    /// already closed is tracked with a closed queue.
    ///
    /// Fails with [`MergeError::AlreadyTracked`] for a duplicate key and
    /// [`MergeError::InvalidState`] once the iterator has stopped.
    pub async fn add_feed(&self, feed: Arc<dyn Feed<T>>, start: Option<u64>) -> Result<()> {
        let key = feed.key();
        let start = start.or_else(|| self.config.start_position(&key));

        let queue = Arc::new(
            FeedQueue::with_wake(feed, Arc::clone(&self.wake)).with_close_timeout(self.close_timeout),
        );

        let tracked = {
            let mut queues = self.queues.write();
            // Checked under the lock so stop() cannot miss this queue.
            let state = self.state();
            if state.is_terminal() {
                return Err(MergeError::InvalidState {
                    expected: "Created or Running".to_string(),
                    actual: state.to_string(),
                });
            }
            if queues.contains_key(&key) {
                return Err(MergeError::AlreadyTracked { feed_key: key });
            }
            queue.open(start)?;
            queues.insert(key, Arc::clone(&queue));
            queues.len()
        };

        metrics::set_tracked_feeds(tracked);
        info!(
            feed_key = %key.short(),
            start = ?queue.index(),
            open = queue.is_open(),
            tracked,
            "Feed added to merge"
        );
        self.wake.wake();
        Ok(())
    }

    /// Stop tracking a feed and close its queue.
    ///
    /// Returns `false` if the feed was not tracked.
    pub async fn remove_feed(&self, key: &FeedKey) -> bool {
        let (queue, tracked) = {
            let mut queues = self.queues.write();
            (queues.remove(key), queues.len())
        };

        let Some(queue) = queue else {
            return false;
        };

        queue.close().await;
        metrics::set_tracked_feeds(tracked);
        info!(feed_key = %key.short(), tracked, "Feed removed from merge");
        self.wake.wake();
        true
    }

    /// Start merging. Opens any tracked queue that is not open, at the
    /// position it was added with.
    ///
    /// No-op if already running; fails once stopped.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            IteratorState::Running => return Ok(()),
            IteratorState::Stopped => {
                return Err(MergeError::InvalidState {
                    expected: "Created".to_string(),
                    actual: IteratorState::Stopped.to_string(),
                });
            }
            IteratorState::Created => {}
        }

        for queue in self.snapshot() {
            if !queue.is_open() {
                let start = queue
                    .start_position()
                    .or_else(|| self.config.start_position(&queue.key()));
                queue.open(start)?;
            }
        }

        let started = self.state_tx.send_if_modified(|state| {
            if *state == IteratorState::Created {
                *state = IteratorState::Running;
                true
            } else {
                false
            }
        });

        if started {
            metrics::set_iterator_state("Running");
            info!(feeds = self.len(), "Merge iterator started");
        }
        self.wake.wake();
        Ok(())
    }

    /// Stop merging and close every queue. Idempotent.
    ///
    /// Any `next()` in progress observes the stop and ends the sequence.
    pub async fn stop(&self) {
        let previous = self.state_tx.send_replace(IteratorState::Stopped);
        if previous == IteratorState::Stopped {
            return;
        }

        info!(previous = %previous, feeds = self.len(), "Stopping merge iterator");
        metrics::set_iterator_state("Stopped");
        self.wake.wake();

        let queues = self.snapshot();
        futures::future::join_all(queues.iter().map(|queue| queue.close())).await;

        // Re-wake in case the loop went back to sleep while queues closed.
        self.wake.wake();
        debug!(closed = queues.len(), "Merge iterator stopped");
    }

    /// Produce the next block.
    ///
    /// Suspends until a block is selectable. Before `start()` this waits for
    /// `start()` or `stop()`. Returns `None` once the iterator is stopped.
    pub async fn next(&self) -> Option<Result<Block<T>>> {
        let mut stall = self.stall.lock().await;

        loop {
            match self.state() {
                IteratorState::Stopped => {
                    stall.disarm();
                    return None;
                }
                IteratorState::Created => {
                    self.wake.wait().await;
                    continue;
                }
                IteratorState::Running => {}
            }

            let queues = self.snapshot();

            for queue in &queues {
                if let Some(err) = queue.take_error() {
                    let key = queue.key();
                    warn!(feed_key = %key.short(), error = %err, "Surfacing feed read error");
                    metrics::record_feed_error(&key.short());
                    return Some(Err(MergeError::from_feed(key, err)));
                }
            }

            let selection_start = Instant::now();
            let (owners, candidates) = heads(&queues);
            let choice = self.selector.select(&candidates);
            metrics::record_selection_latency(selection_start.elapsed());

            match choice {
                Some(index) if index >= candidates.len() => {
                    error!(
                        index,
                        candidates = candidates.len(),
                        "Selector returned out-of-range index, stopping merge"
                    );
                    metrics::record_selector_violation();
                    stall.disarm();
                    self.stop().await;
                    return Some(Err(MergeError::SelectionIndexOutOfRange {
                        index,
                        len: candidates.len(),
                    }));
                }
                Some(index) => {
                    stall.disarm();
                    let queue = owners[index];
                    match queue.pop().await {
                        Ok(block) => {
                            trace!(feed_key = %block.feed_key.short(), seq = block.seq, "Emitting block");
                            metrics::record_block_emitted(&block.feed_key.short());
                            return Some(Ok(block));
                        }
                        Err(e) if e.is_benign() => {
                            debug!(feed_key = %queue.key().short(), "Queue closed between selection and pop");
                            metrics::record_closed_race(&queue.key().short());
                            continue;
                        }
                        Err(e) => {
                            metrics::record_feed_error(&queue.key().short());
                            return Some(Err(e));
                        }
                    }
                }
                None => {}
            }

            // Nothing selectable: sleep until woken or the stall timer fires.
            stall.arm();
            let woken = self.wake.wait_for(stall.remaining()).await;

            // A wake at the deadline gets a fresh selection first; the timer
            // stays armed, so the report follows on the next pass if needed.
            if !woken && stall.expired() {
                stall.disarm();
                self.report_stall();
            }
        }
    }

    /// Consume the iterator as a [`Stream`] of blocks.
    ///
    /// The stream ends when the iterator stops.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Result<Block<T>>> {
        futures::stream::unfold(self, |merge| async move {
            let item = merge.next().await?;
            Some((item, merge))
        })
    }

    fn snapshot(&self) -> Vec<Arc<FeedQueue<T>>> {
        self.queues.read().values().cloned().collect()
    }

    fn report_stall(&self) {
        let queues = self.snapshot();
        let feeds = queues.len();
        let (_, candidates) = heads(&queues);
        warn!(
            candidates = candidates.len(),
            feeds,
            timeout_ms = self.stall_timeout.as_millis() as u64,
            "Merge stalled: no selectable candidate"
        );
        metrics::record_stall(candidates.len());

        // No subscribers is fine.
        let _ = self.stalled_tx.send(StallEvent {
            candidates,
            feeds,
            timeout: self.stall_timeout,
        });
    }
}

/// Open queues with a buffered head, paired with that head.
fn heads<T>(queues: &[Arc<FeedQueue<T>>]) -> (Vec<&Arc<FeedQueue<T>>>, Vec<Block<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    queues
        .iter()
        .filter_map(|queue| queue.peek().map(|head| (queue, head)))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FeedError, FeedResult};
    use crate::feed::{FeedCursor, MemoryFeed};
    use crate::selector::LowestSeq;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn key(n: u8) -> FeedKey {
        FeedKey::from_bytes([n; 32])
    }

    fn memory_feed(n: u8, blocks: u32) -> Arc<MemoryFeed<u32>> {
        let feed = Arc::new(MemoryFeed::new(key(n)));
        feed.append_many(0..blocks);
        feed
    }

    fn lowest() -> MergeIterator<u32> {
        MergeIterator::new(LowestSeq, MergeConfig::for_testing()).unwrap()
    }

    async fn next_block(merge: &MergeIterator<u32>) -> Block<u32> {
        tokio::time::timeout(Duration::from_secs(2), merge.next())
            .await
            .expect("next should not hang")
            .expect("sequence should not end")
            .expect("should yield a block")
    }

    #[test]
    fn test_initial_state() {
        let merge = lowest();
        assert_eq!(merge.state(), IteratorState::Created);
        assert!(!merge.is_running());
        assert!(merge.is_empty());
        assert_eq!(*merge.state_receiver().borrow(), IteratorState::Created);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MergeConfig {
            stall_timeout: "soon".to_string(),
            ..MergeConfig::default()
        };
        assert!(matches!(
            MergeIterator::<u32>::new(LowestSeq, config),
            Err(MergeError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_add_feed_tracks_and_rejects_duplicates() {
        let merge = lowest();
        let feed = memory_feed(1, 3);

        merge.add_feed(feed.clone(), None).await.unwrap();
        assert!(merge.has_feed(&key(1)));
        assert_eq!(merge.feeds(), vec![key(1)]);
        assert_eq!(merge.len(), 1);

        let err = merge.add_feed(feed, None).await.unwrap_err();
        assert!(matches!(err, MergeError::AlreadyTracked { feed_key } if feed_key == key(1)));
        assert_eq!(merge.len(), 1);

        merge.stop().await;
    }

    #[tokio::test]
    async fn test_start_position_precedence() {
        let config = MergeConfig::for_testing()
            .with_start_position(key(1), 3)
            .with_start_position(key(2), 4);
        let merge = MergeIterator::new(LowestSeq, config).unwrap();

        // Explicit start wins over config.
        merge.add_feed(memory_feed(1, 10), Some(7)).await.unwrap();
        // Config used when no explicit start.
        merge.add_feed(memory_feed(2, 10), None).await.unwrap();
        // Neither: 0.
        merge.add_feed(memory_feed(3, 10), None).await.unwrap();

        assert_eq!(merge.position(&key(1)), Some(7));
        assert_eq!(merge.position(&key(2)), Some(4));
        assert_eq!(merge.position(&key(3)), Some(0));

        merge.stop().await;
    }

    /// Feed whose first cursor reports the feed closed; later cursors work.
    struct InterruptedFeed {
        inner: MemoryFeed<u32>,
        interrupted: AtomicBool,
    }

    impl Feed<u32> for InterruptedFeed {
        fn key(&self) -> FeedKey {
            self.inner.key()
        }

        fn len(&self) -> u64 {
            self.inner.len()
        }

        fn open_cursor(&self, start: u64) -> FeedResult<Box<dyn FeedCursor<u32>>> {
            if !self.interrupted.swap(true, Ordering::SeqCst) {
                return Err(FeedError::Closed);
            }
            self.inner.open_cursor(start)
        }
    }

    #[tokio::test]
    async fn test_start_reopens_interrupted_feed_at_requested_position() {
        let config = MergeConfig::for_testing().with_start_position(key(1), 3);
        let merge = MergeIterator::new(LowestSeq, config).unwrap();

        let inner = MemoryFeed::new(key(1));
        inner.append_many(0..10u32);
        let feed = Arc::new(InterruptedFeed {
            inner,
            interrupted: AtomicBool::new(false),
        });

        merge.add_feed(feed, Some(7)).await.unwrap();
        assert_eq!(merge.position(&key(1)), None);

        merge.start().await.unwrap();
        assert_eq!(merge.position(&key(1)), Some(7));
        for seq in 7..10 {
            assert_eq!(next_block(&merge).await.seq, seq);
        }

        merge.stop().await;
    }

    #[tokio::test]
    async fn test_merges_in_lowest_seq_order() {
        let merge = lowest();
        merge.add_feed(memory_feed(1, 2), None).await.unwrap();
        merge.add_feed(memory_feed(2, 2), None).await.unwrap();
        merge.start().await.unwrap();

        let mut emitted = Vec::new();
        for _ in 0..4 {
            let block = next_block(&merge).await;
            emitted.push((block.feed_key, block.seq));
        }

        // LowestSeq only sees heads that are buffered; each feed is still
        // delivered in order.
        for k in [key(1), key(2)] {
            let seqs: Vec<u64> = emitted.iter().filter(|(f, _)| *f == k).map(|(_, s)| *s).collect();
            assert_eq!(seqs, vec![0, 1]);
        }

        merge.stop().await;
    }

    #[tokio::test]
    async fn test_next_before_start_waits_for_start() {
        let merge = Arc::new(lowest());
        merge.add_feed(memory_feed(1, 1), None).await.unwrap();

        let consumer = Arc::clone(&merge);
        let handle = tokio::spawn(async move { consumer.next().await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!handle.is_finished());

        merge.start().await.unwrap();
        let block = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("next should resolve after start")
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(block.seq, 0);

        merge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_sequence_and_is_terminal() {
        let merge = lowest();
        merge.add_feed(memory_feed(1, 5), None).await.unwrap();
        merge.start().await.unwrap();
        merge.start().await.unwrap();

        merge.stop().await;
        merge.stop().await;
        assert_eq!(merge.state(), IteratorState::Stopped);
        assert!(merge.next().await.is_none());

        assert!(matches!(merge.start().await, Err(MergeError::InvalidState { .. })));
        assert!(matches!(
            merge.add_feed(memory_feed(2, 1), None).await,
            Err(MergeError::InvalidState { .. })
        ));
        // Membership survives stop.
        assert!(merge.has_feed(&key(1)));
        assert_eq!(merge.position(&key(1)), None);
    }

    #[tokio::test]
    async fn test_stop_releases_idle_next() {
        let merge = Arc::new(lowest());
        merge.add_feed(Arc::new(MemoryFeed::<u32>::new(key(1))), None).await.unwrap();
        merge.start().await.unwrap();

        let consumer = Arc::clone(&merge);
        let handle = tokio::spawn(async move { consumer.next().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), merge.stop())
            .await
            .expect("stop should return promptly");
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("next should be released")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_remove_feed() {
        let merge = lowest();
        merge.add_feed(memory_feed(1, 3), None).await.unwrap();
        merge.add_feed(memory_feed(2, 3), None).await.unwrap();

        assert!(merge.remove_feed(&key(1)).await);
        assert!(!merge.remove_feed(&key(1)).await);
        assert_eq!(merge.feeds(), vec![key(2)]);

        merge.start().await.unwrap();
        for seq in 0..3 {
            let block = next_block(&merge).await;
            assert_eq!((block.feed_key, block.seq), (key(2), seq));
        }
        merge.stop().await;
    }

    #[tokio::test]
    async fn test_selector_out_of_range_is_fatal() {
        let selector = |candidates: &[Block<u32>]| -> Option<usize> {
            if candidates.is_empty() {
                None
            } else {
                Some(candidates.len())
            }
        };
        let merge = MergeIterator::new(selector, MergeConfig::for_testing()).unwrap();
        merge.add_feed(memory_feed(1, 1), None).await.unwrap();
        merge.start().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), merge.next())
            .await
            .expect("next should not hang");
        assert!(matches!(
            result,
            Some(Err(MergeError::SelectionIndexOutOfRange { index: 1, len: 1 }))
        ));
        assert_eq!(merge.state(), IteratorState::Stopped);
        assert!(merge.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stall_event_carries_rejected_candidates() {
        let never = |_: &[Block<u32>]| -> Option<usize> { None };
        let merge = Arc::new(MergeIterator::new(never, MergeConfig::for_testing()).unwrap());
        let mut stalled = merge.subscribe_stalled();

        merge.add_feed(memory_feed(1, 1), None).await.unwrap();
        merge.start().await.unwrap();

        let consumer = Arc::clone(&merge);
        let handle = tokio::spawn(async move { consumer.next().await });

        let event = tokio::time::timeout(Duration::from_secs(1), stalled.recv())
            .await
            .expect("stall should fire")
            .unwrap();
        assert_eq!(event.timeout, Duration::from_millis(50));
        assert_eq!(event.feeds, 1);
        assert_eq!(event.candidates.len(), 1);
        assert_eq!(event.candidates[0].feed_key, key(1));
        assert!(merge.is_running());

        merge.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("next should end after stop")
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_stall_report_reads_current_heads() {
        let never = |_: &[Block<u32>]| -> Option<usize> { None };
        let merge = MergeIterator::new(never, MergeConfig::for_testing()).unwrap();
        let mut stalled = merge.subscribe_stalled();

        let feed = Arc::new(MemoryFeed::<u32>::new(key(1)));
        merge.add_feed(feed.clone(), None).await.unwrap();
        merge.add_feed(Arc::new(MemoryFeed::<u32>::new(key(2))), None).await.unwrap();

        merge.report_stall();
        let empty = stalled.recv().await.unwrap();
        assert!(empty.is_starved());
        assert_eq!(empty.feeds, 2);

        // A head buffered after the loop last looked still shows up.
        feed.append(5);
        tokio::time::timeout(Duration::from_secs(1), async {
            while heads(&merge.snapshot()).1.is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("head should be buffered");

        merge.report_stall();
        let event = stalled.recv().await.unwrap();
        assert_eq!(event.candidates.len(), 1);
        assert_eq!((event.candidates[0].feed_key, event.candidates[0].seq), (key(1), 0));

        merge.stop().await;
    }
}
