//! Merge iterator state and notification types.
//!
//! # State Transitions
//!
//! ```text
//!              start()
//! Created ─────────────→ Running
//!    │                      │
//!    │ stop()               │ stop() / selector violation
//!    ↓                      ↓
//! Stopped ←─────────────────┘
//! ```
//!
//! - **Created**: Initial state after `MergeIterator::new()`. Feeds may be
//!   added; `next()` waits for `start()`.
//! - **Running**: The merge loop selects and emits blocks.
//! - **Stopped**: Every queue is closed. Terminal: a new iterator is required.

use crate::feed::Block;
use std::time::Duration;

/// State of a merge iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::MergeIterator::start) to begin merging.
    Created,

    /// Selecting and emitting blocks.
    Running,

    /// Stopped. The sequence has ended and cannot resume.
    Stopped,
}

impl IteratorState {
    /// Check if the iterator can no longer produce blocks.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IteratorState::Stopped)
    }
}

impl std::fmt::Display for IteratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IteratorState::Created => write!(f, "Created"),
            IteratorState::Running => write!(f, "Running"),
            IteratorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Advisory notification: no candidate was selectable for a full stall
/// timeout.
///
/// Carries the candidate set the selector rejected (possibly empty). Stalls
/// are not errors and change no state.
#[derive(Debug, Clone)]
pub struct StallEvent<T> {
    /// Buffered heads at the time the stall fired
    pub candidates: Vec<Block<T>>,
    /// Number of tracked feeds
    pub feeds: usize,
    /// Configured stall timeout
    pub timeout: Duration,
}

impl<T> StallEvent<T> {
    /// Check if the stall happened with nothing buffered at all.
    pub fn is_starved(&self) -> bool {
        self.candidates.is_empty()
    }
}
