// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stall detection timer for the merge loop.
//!
//! The timer is a deadline, not a task. The merge loop arms it when no
//! candidate is selectable, waits on its wake trigger for at most
//! [`remaining()`](StallTimer::remaining), and checks
//! [`expired()`](StallTimer::expired) afterwards. Letting it fire changes no
//! data; it only produces a stall notification and a fresh selection attempt.

use std::time::Duration;
use tokio::time::Instant;

/// Arm-once deadline used to report "no eligible candidate" after a timeout.
#[derive(Debug, Clone)]
pub struct StallTimer {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl StallTimer {
    /// Create a disarmed timer.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    /// Configured stall timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Arm the timer unless it is already armed. Returns `true` if newly armed.
    pub fn arm(&mut self) -> bool {
        if self.deadline.is_some() {
            return false;
        }
        self.deadline = Some(Instant::now() + self.timeout);
        true
    }

    /// Disarm the timer.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Check if the timer is armed.
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the timer fires, or `None` if disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Check if the armed deadline has passed.
    pub fn expired(&self) -> bool {
        matches!(self.deadline, Some(deadline) if Instant::now() >= deadline)
    }
}
