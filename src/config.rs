//! Configuration for the merge engine.
//!
//! Configuration is passed to [`MergeIterator::new()`](crate::MergeIterator::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use feed_merge::config::MergeConfig;
//! use feed_merge::FeedKey;
//! use std::time::Duration;
//!
//! let config = MergeConfig::default()
//!     .with_stall_timeout(Duration::from_millis(250))
//!     .with_start_position(FeedKey::from_bytes([1; 32]), 42);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! MergeConfig
//! ├── stall_timeout: String           # "no eligible candidate" report delay
//! ├── close_timeout: String           # how long close() waits for producers
//! ├── stall_channel_capacity: usize   # broadcast buffer for stall events
//! └── start_positions: {FeedKey: seq} # resume points per feed
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "stall_timeout": "1s",
//!   "close_timeout": "5s",
//!   "start_positions": {
//!     "0101010101010101010101010101010101010101010101010101010101010101": 17
//!   }
//! }
//! ```

use crate::error::{MergeError, Result};
use crate::feed::FeedKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Merge iterator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// How long the merge loop may go without a selectable candidate before a
    /// stall is reported (e.g., "1s", "50ms").
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout: String,

    /// How long `close()` waits for a queue's producer task to exit before
    /// aborting it.
    #[serde(default = "default_close_timeout")]
    pub close_timeout: String,

    /// Buffered stall events per subscriber before lagging ones skip ahead.
    #[serde(default = "default_stall_channel_capacity")]
    pub stall_channel_capacity: usize,

    /// Starting `seq` per feed, used when `add_feed` is not given an explicit
    /// start (e.g., to resume from a checkpoint).
    #[serde(default)]
    pub start_positions: HashMap<FeedKey, u64>,
}

fn default_stall_timeout() -> String {
    "1s".to_string()
}

fn default_close_timeout() -> String {
    "5s".to_string()
}

fn default_stall_channel_capacity() -> usize {
    16
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            stall_timeout: default_stall_timeout(),
            close_timeout: default_close_timeout(),
            stall_channel_capacity: default_stall_channel_capacity(),
            start_positions: HashMap::new(),
        }
    }
}

impl MergeConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            stall_timeout: "50ms".to_string(),
            close_timeout: "1s".to_string(),
            ..Default::default()
        }
    }

    /// Set the stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = humantime::format_duration(timeout).to_string();
        self
    }

    /// Set the starting `seq` for one feed.
    pub fn with_start_position(mut self, feed_key: FeedKey, seq: u64) -> Self {
        self.start_positions.insert(feed_key, seq);
        self
    }

    /// Parse the stall timeout, falling back to 1 second.
    pub fn stall_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.stall_timeout).unwrap_or(DEFAULT_STALL_TIMEOUT)
    }

    /// Parse the close timeout, falling back to 5 seconds.
    pub fn close_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.close_timeout).unwrap_or(DEFAULT_CLOSE_TIMEOUT)
    }

    /// Configured start position for a feed, if any.
    pub fn start_position(&self, feed_key: &FeedKey) -> Option<u64> {
        self.start_positions.get(feed_key).copied()
    }

    /// Reject configs that would silently fall back or misbehave.
    pub fn validate(&self) -> Result<()> {
        let stall = humantime::parse_duration(&self.stall_timeout).map_err(|e| {
            MergeError::Config(format!("invalid stall_timeout {:?}: {}", self.stall_timeout, e))
        })?;
        if stall.is_zero() {
            return Err(MergeError::Config("stall_timeout must be non-zero".to_string()));
        }
        humantime::parse_duration(&self.close_timeout).map_err(|e| {
            MergeError::Config(format!("invalid close_timeout {:?}: {}", self.close_timeout, e))
        })?;
        if self.stall_channel_capacity == 0 {
            return Err(MergeError::Config(
                "stall_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
