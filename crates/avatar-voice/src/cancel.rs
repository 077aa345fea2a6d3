//! Cooperative cancellation for the work spawned by one avatar run.

use crate::error::{VoiceError, VoiceResult};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared, checkable cancellation flag.
///
/// Clones observe the same flag. Work checks it when scheduling (to avoid queueing
/// stale work) and again when firing (to skip work queued before the cancel). Effects
/// that already happened are never undone.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the flag and wake every waiter. Returns false if it was already cancelled.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the check so a cancel in between is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Drive `fut` unless the token is (or becomes) cancelled first.
    pub async fn run_until_cancelled<F: Future>(&self, fut: F) -> VoiceResult<F::Output> {
        if self.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(VoiceError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
