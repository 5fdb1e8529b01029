//! Cooperative cancellation for code channels.
//!
//! Codes hold a clone of their channel's token at creation time. When a
//! channel is invalidated the source swaps in a fresh token, so codes that
//! were already in flight observe the cancellation while codes created
//! afterwards start with a clean slate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A clonable cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and wake all waiters. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register the waiter before checking the flag so a concurrent
            // cancel() cannot slip between check and wait.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Per-channel token source.
#[derive(Debug, Default)]
pub struct TokenSource {
    current: Mutex<CancellationToken>,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that codes created right now should carry.
    pub fn current(&self) -> CancellationToken {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Cancel every outstanding token and hand out a fresh one from here on.
    pub fn invalidate(&self) {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        current.cancel();
        *current = CancellationToken::new();
    }
}
