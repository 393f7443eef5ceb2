// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the merge engine.
//!
//! Two layers of errors exist:
//!
//! - [`FeedError`] is reported by the feed collaborator (storage, transport).
//! - [`MergeError`] is what queues and the merge iterator hand to callers.
//!
//! # Error Categories
//!
//! | Error Type | Benign | Fatal | Description |
//! |------------|--------|-------|-------------|
//! | `QueueClosed` | Yes | No | Queue not open, or closed while a `pop()` was waiting |
//! | `AlreadyTracked` | No | No | `add_feed` called twice for the same key |
//! | `SelectionIndexOutOfRange` | No | Yes | Selector returned an index outside the candidate set |
//! | `FeedRead` | No | No | Transport/storage failure reported by a feed |
//! | `InvalidState` | No | Yes | Lifecycle violation (e.g. `start()` after `stop()`) |
//! | `Config` | No | No | Configuration invalid |
//!
//! The merge loop only ever distinguishes "queue closed" (benign, swallowed)
//! from everything else (surfaced to the consumer).

use crate::feed::FeedKey;
use thiserror::Error;

/// Result type alias for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;

/// Result type alias for feed collaborator operations.
pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// Errors reported by a feed or one of its cursors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// The feed or cursor was closed. Pending reads resolve with this.
    #[error("feed closed")]
    Closed,

    /// Storage or transport failure while reading a block.
    #[error("feed read failed: {0}")]
    Read(String),
}

impl FeedError {
    /// Check if this is the benign "closed" signal.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Errors that can occur while queueing and merging feeds.
#[derive(Error, Debug)]
pub enum MergeError {
    /// `pop()` was called on a queue that is not open, or the queue was
    /// closed while the caller was waiting.
    ///
    /// Recoverable: reopen the queue or drop the feed.
    #[error("queue closed ({feed_key})")]
    QueueClosed { feed_key: FeedKey },

    /// The feed is already attached to this merge iterator.
    ///
    /// Programmer error, not retried.
    #[error("feed already tracked ({feed_key})")]
    AlreadyTracked { feed_key: FeedKey },

    /// A selector returned an index outside the candidate set.
    ///
    /// Fatal: the iterator stops rather than guess.
    #[error("selector returned index {index} for {len} candidates")]
    SelectionIndexOutOfRange { index: usize, len: usize },

    /// A feed reported a non-benign read error.
    ///
    /// Whether this is fatal to the whole merge is the caller's decision.
    #[error("feed read error ({feed_key}): {source}")]
    FeedRead {
        feed_key: FeedKey,
        #[source]
        source: FeedError,
    },

    /// Lifecycle violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MergeError {
    /// Create a feed read error, folding the benign closed case into `QueueClosed`.
    pub fn from_feed(feed_key: FeedKey, source: FeedError) -> Self {
        match source {
            FeedError::Closed => Self::QueueClosed { feed_key },
            source => Self::FeedRead { feed_key, source },
        }
    }

    /// Check if this error is the benign "queue closed" race.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::QueueClosed { .. })
    }

    /// Check if this error must terminate the merge.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::SelectionIndexOutOfRange { .. } => true,
            Self::InvalidState { .. } => true,
            Self::QueueClosed { .. } => false,
            Self::AlreadyTracked { .. } => false,
            Self::FeedRead { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// The feed this error relates to, if any.
    pub fn feed_key(&self) -> Option<&FeedKey> {
        match self {
            Self::QueueClosed { feed_key }
            | Self::AlreadyTracked { feed_key }
            | Self::FeedRead { feed_key, .. } => Some(feed_key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FeedKey {
        FeedKey::from_bytes([7; 32])
    }

    #[test]
    fn test_queue_closed_is_benign() {
        let err = MergeError::QueueClosed { feed_key: key() };
        assert!(err.is_benign());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("queue closed"));
    }

    #[test]
    fn test_selection_out_of_range_is_fatal() {
        let err = MergeError::SelectionIndexOutOfRange { index: 3, len: 2 };
        assert!(err.is_fatal());
        assert!(!err.is_benign());
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn test_from_feed_closed_folds_to_queue_closed() {
        let err = MergeError::from_feed(key(), FeedError::Closed);
        assert!(matches!(err, MergeError::QueueClosed { .. }));
    }

    #[test]
    fn test_from_feed_read_keeps_source() {
        let err = MergeError::from_feed(key(), FeedError::Read("disk gone".to_string()));
        assert!(!err.is_benign());
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("disk gone"));
        assert_eq!(err.feed_key(), Some(&key()));
    }

    #[test]
    fn test_already_tracked_formatting() {
        let err = MergeError::AlreadyTracked { feed_key: key() };
        assert!(err.to_string().contains(&key().to_string()));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_invalid_state_formatting() {
        let err = MergeError::InvalidState {
            expected: "Running".to_string(),
            actual: "Stopped".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("Running"));
        assert!(err.to_string().contains("Stopped"));
        assert!(err.feed_key().is_none());
    }

    #[test]
    fn test_feed_error_is_closed() {
        assert!(FeedError::Closed.is_closed());
        assert!(!FeedError::Read("x".to_string()).is_closed());
    }
}
