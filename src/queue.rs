// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-slot pull queue over one feed's live cursor.
//!
//! A [`FeedQueue`] turns a push-driven, unbounded-rate feed cursor into a
//! demand-paced buffer holding at most one block, so the merge loop can reason
//! about "the current head of this feed" without racing the source.
//!
//! # State Machine
//!
//! ```text
//!             open(start)                 block arrives
//!  Closed ───────────────────→ Open/Empty ─────────────→ Open/Ready(block)
//!    ↑                            ↑  │                        │
//!    │ close() / feed closed      │  │ read error             │ pop()
//!    └────────────────────────────┤  ↓                        │
//!                                 │ Open/Failed(err) ── pop() ┤
//!                                 └───────────────────────────┘
//! ```
//!
//! # Backpressure
//!
//! Each open queue owns a producer task that loops:
//! 1. Wait until the slot is empty (released by `pop()`)
//! 2. Await the cursor's next block (demand-paced: nothing is read ahead)
//! 3. Store it in the slot and wake waiters
//!
//! The cursor is therefore never advanced while a block is buffered.
//!
//! # Closing
//!
//! `close()` marks the queue closed, releases any suspended `pop()` with
//! [`MergeError::QueueClosed`], signals the producer to drop its cursor, and
//! waits (bounded) for it to exit. A feed closing on its own has the same
//! effect on the queue.

use crate::error::{FeedError, MergeError, Result};
use crate::feed::{Block, Feed, FeedCursor, FeedKey};
use crate::trigger::Trigger;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, trace, warn, Instrument};

/// Default bound on how long `close()` waits for the producer task.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Contents of the single buffer slot.
#[derive(Debug)]
enum Slot<T> {
    Empty,
    Ready(Block<T>),
    Failed(FeedError),
}

#[derive(Debug)]
struct QueueState<T> {
    open: bool,
    /// `seq` of the next block `pop()` returns; `None` while closed.
    index: Option<u64>,
    /// Position the queue was last asked to open at; survives close.
    start: Option<u64>,
    slot: Slot<T>,
    /// Bumped on every open/close so stale producers cannot write.
    generation: u64,
}

struct Shared<T> {
    key: FeedKey,
    state: Mutex<QueueState<T>>,
    /// Slot filled, failed, or queue closed. Wakes suspended `pop()` callers.
    updated: Trigger,
    /// Slot emptied. Lets the producer read the next block.
    released: Trigger,
    /// Head-change notification for an owning merge loop.
    on_head: Option<Arc<Trigger>>,
}

impl<T> Shared<T> {
    fn notify_head(&self) {
        self.updated.wake();
        if let Some(on_head) = &self.on_head {
            on_head.wake();
        }
    }
}

/// Running producer task and its shutdown signal.
struct Producer {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// What the producer does after handling one cursor result.
enum Flow {
    Continue,
    Exit,
}

/// Demand-paced single-slot buffer over one feed.
pub struct FeedQueue<T> {
    feed: Arc<dyn Feed<T>>,
    shared: Arc<Shared<T>>,
    producer: Mutex<Option<Producer>>,
    close_timeout: Duration,
}

impl<T: Clone + Send + Sync + 'static> FeedQueue<T> {
    /// Create a closed queue for `feed`.
    pub fn new(feed: Arc<dyn Feed<T>>) -> Self {
        Self::build(feed, None, DEFAULT_CLOSE_TIMEOUT)
    }

    /// Create a closed queue that also wakes `on_head` whenever its head
    /// changes (block buffered, read error, or close).
    pub fn with_wake(feed: Arc<dyn Feed<T>>, on_head: Arc<Trigger>) -> Self {
        Self::build(feed, Some(on_head), DEFAULT_CLOSE_TIMEOUT)
    }

    /// Override how long `close()` waits for the producer task.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn build(feed: Arc<dyn Feed<T>>, on_head: Option<Arc<Trigger>>, close_timeout: Duration) -> Self {
        let key = feed.key();
        Self {
            feed,
            shared: Arc::new(Shared {
                key,
                state: Mutex::new(QueueState {
                    open: false,
                    index: None,
                    start: None,
                    slot: Slot::Empty,
                    generation: 0,
                }),
                updated: Trigger::new(),
                released: Trigger::new(),
                on_head,
            }),
            producer: Mutex::new(None),
            close_timeout,
        }
    }

    /// Key of the underlying feed.
    pub fn key(&self) -> FeedKey {
        self.shared.key
    }

    /// The underlying feed (shared, not owned).
    pub fn feed(&self) -> &Arc<dyn Feed<T>> {
        &self.feed
    }

    /// Check if the queue has an active cursor.
    pub fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    /// `seq` of the next block this queue will produce, `None` while closed.
    pub fn index(&self) -> Option<u64> {
        self.shared.state.lock().index
    }

    /// Position passed to the most recent `open()`, even if the cursor never
    /// opened or has since closed. `None` if never opened.
    pub fn start_position(&self) -> Option<u64> {
        self.shared.state.lock().start
    }

    /// Open a live cursor at `start` (default 0) and begin buffering.
    ///
    /// No-op if already open. If the feed is already closed the queue stays
    /// closed and this returns `Ok(())`; other cursor errors are returned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, start: Option<u64>) -> Result<()> {
        let mut producer = self.producer.lock();
        if self.is_open() {
            return Ok(());
        }

        let start = start.unwrap_or(0);
        let key = self.shared.key;
        self.shared.state.lock().start = Some(start);

        let cursor = match self.feed.open_cursor(start) {
            Ok(cursor) => cursor,
            Err(FeedError::Closed) => {
                debug!(feed_key = %key.short(), "Feed closed before queue opened, staying closed");
                return Ok(());
            }
            Err(e) => return Err(MergeError::from_feed(key, e)),
        };

        let generation = {
            let mut state = self.shared.state.lock();
            state.open = true;
            state.index = Some(start);
            state.slot = Slot::Empty;
            state.generation += 1;
            state.generation
        };

        if let Some(stale) = producer.take() {
            stale.handle.abort();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("feed_queue", feed_key = %key.short());
        let handle = tokio::spawn(
            run_producer(Arc::clone(&self.shared), cursor, generation, shutdown_rx).instrument(span),
        );
        *producer = Some(Producer {
            handle,
            shutdown_tx,
        });

        debug!(feed_key = %key.short(), start, "Feed queue opened");
        Ok(())
    }

    /// Tear down the cursor and release any suspended `pop()`. Idempotent.
    pub async fn close(&self) {
        let producer = self.producer.lock().take();

        let was_open = {
            let mut state = self.shared.state.lock();
            let was_open = state.open;
            state.open = false;
            state.index = None;
            state.slot = Slot::Empty;
            state.generation += 1;
            was_open
        };
        self.shared.notify_head();

        if let Some(mut producer) = producer {
            let _ = producer.shutdown_tx.send(true);
            match tokio::time::timeout(self.close_timeout, &mut producer.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => {
                    warn!(feed_key = %self.shared.key.short(), error = %e, "Feed queue producer panicked");
                }
                Err(_) => {
                    warn!(
                        feed_key = %self.shared.key.short(),
                        timeout_ms = self.close_timeout.as_millis() as u64,
                        "Feed queue producer did not exit in time, aborting"
                    );
                    producer.handle.abort();
                }
            }
        }

        if was_open {
            debug!(feed_key = %self.shared.key.short(), "Feed queue closed");
        }
    }

    /// The buffered head, without consuming it.
    pub fn peek(&self) -> Option<Block<T>> {
        let state = self.shared.state.lock();
        match &state.slot {
            Slot::Ready(block) if state.open => Some(block.clone()),
            _ => None,
        }
    }

    /// Check if a read error is waiting to be consumed.
    pub fn has_error(&self) -> bool {
        let state = self.shared.state.lock();
        state.open && matches!(state.slot, Slot::Failed(_))
    }

    /// Take a pending read error, letting the producer continue.
    pub fn take_error(&self) -> Option<FeedError> {
        let err = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut state.slot, Slot::Empty) {
                Slot::Failed(err) => Some(err),
                other => {
                    state.slot = other;
                    None
                }
            }
        };
        if err.is_some() {
            self.shared.released.wake();
        }
        err
    }

    /// Consume the buffered head, waiting for one if the slot is empty.
    ///
    /// Fails with [`MergeError::QueueClosed`] if the queue is not open, or is
    /// closed while waiting. A pending read error is returned as
    /// [`MergeError::FeedRead`].
    pub async fn pop(&self) -> Result<Block<T>> {
        loop {
            if let Some(result) = self.try_pop() {
                return result;
            }
            self.shared.updated.wait().await;
        }
    }

    fn try_pop(&self) -> Option<Result<Block<T>>> {
        let key = self.shared.key;
        let result = {
            let mut state = self.shared.state.lock();
            if !state.open {
                return Some(Err(MergeError::QueueClosed { feed_key: key }));
            }
            match std::mem::replace(&mut state.slot, Slot::Empty) {
                Slot::Empty => return None,
                Slot::Ready(block) => {
                    state.index = state.index.map(|index| index + 1);
                    Ok(block)
                }
                Slot::Failed(err) => Err(MergeError::from_feed(key, err)),
            }
        };
        self.shared.released.wake();
        Some(result)
    }
}

impl<T> Drop for FeedQueue<T> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.get_mut().take() {
            let _ = producer.shutdown_tx.send(true);
        }
    }
}

/// Producer loop: one block in flight at a time.
async fn run_producer<T: Clone + Send + Sync + 'static>(
    shared: Arc<Shared<T>>,
    mut cursor: Box<dyn FeedCursor<T>>,
    generation: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    trace!("Feed queue producer started");

    'produce: loop {
        // Backpressure: do not touch the cursor until the slot is consumed.
        loop {
            let slot_empty = {
                let state = shared.state.lock();
                if state.generation != generation || !state.open {
                    break 'produce;
                }
                matches!(state.slot, Slot::Empty)
            };
            if slot_empty {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break 'produce,
                _ = shared.released.wait() => {}
            }
        }

        let result = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break 'produce,
            result = cursor.next() => result,
        };

        match deliver(&shared, generation, result) {
            Flow::Continue => {}
            Flow::Exit => break,
        }
    }

    cursor.close();
    trace!("Feed queue producer exited");
}

/// Store one cursor result in the slot and wake waiters.
fn deliver<T>(shared: &Shared<T>, generation: u64, result: std::result::Result<Block<T>, FeedError>) -> Flow {
    let flow = {
        let mut state = shared.state.lock();
        if state.generation != generation || !state.open {
            return Flow::Exit;
        }

        match result {
            Ok(block) if Some(block.seq) == state.index => {
                trace!(seq = block.seq, "Buffered block");
                state.slot = Slot::Ready(block);
                Flow::Continue
            }
            Ok(block) => {
                warn!(
                    feed_key = %shared.key.short(),
                    expected = ?state.index,
                    actual = block.seq,
                    "Feed delivered out-of-order block"
                );
                state.slot = Slot::Failed(FeedError::Read(format!(
                    "expected seq {:?}, feed delivered {}",
                    state.index, block.seq
                )));
                Flow::Continue
            }
            Err(FeedError::Closed) => {
                debug!(feed_key = %shared.key.short(), "Feed closed, closing queue");
                state.open = false;
                state.index = None;
                state.slot = Slot::Empty;
                Flow::Exit
            }
            Err(e) => {
                warn!(feed_key = %shared.key.short(), error = %e, "Feed read failed");
                state.slot = Slot::Failed(e);
                Flow::Continue
            }
        }
    };
    shared.notify_head();
    flow
}
