// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Condition-variable-style wake signal.
//!
//! A [`Trigger`] is a waitable flag shared between producers and a waiting
//! loop:
//!
//! - `wake()` releases every task currently waiting and leaves the flag set,
//!   so a task that checks its condition and *then* waits does not miss a
//!   wake that happened in between.
//! - `wait()` consumes the flag (auto-reset) and returns.
//! - `wait_timeout()` bounds the wait; it returns `false` on timeout.
//!
//! ```text
//! producer                      waiter
//!    │                            │ check condition (nothing ready)
//!    │ wake() ── flag = set ──────┤
//!    │                            │ wait() → flag consumed, returns immediately
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Auto-resetting, multi-waiter wake signal.
#[derive(Debug, Default)]
pub struct Trigger {
    notify: Notify,
    pending: AtomicBool,
}

impl Trigger {
    /// Create a trigger with no pending wake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release all current waiters and mark a wake as pending for the next one.
    pub fn wake(&self) {
        self.pending.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Drop any pending wake.
    pub fn reset(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Check if a wake is pending (nobody has consumed it yet).
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until woken. Returns immediately if a wake is already pending.
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register interest before looking at the flag.
        notified.as_mut().enable();

        if self.pending.swap(false, Ordering::AcqRel) {
            return;
        }

        notified.await;
        self.pending.store(false, Ordering::Release);
    }

    /// Wait until woken or until `timeout` elapses.
    ///
    /// Returns `true` if woken, `false` on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Wait until woken, or until `timeout` elapses if one is given.
    pub async fn wait_for(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => self.wait_timeout(timeout).await,
            None => {
                self.wait().await;
                true
            }
        }
    }
}
