//! Streaming/animating flags for one avatar session.
//!
//! The orchestrator owns the [`SessionContext`]. Components it drives get a
//! [`StreamingWriter`]; everyone else gets a read-only [`StreamingView`] and waits on
//! changes instead of polling.

use crate::error::{VoiceError, VoiceResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// `{ isStreaming, isAnimating }`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingState {
    /// Speech audio is playing.
    pub is_streaming: bool,
    /// A viseme sequence is running.
    pub is_animating: bool,
}

/// Owner of the session flags. One per orchestrator.
#[derive(Debug)]
pub struct SessionContext {
    tx: Arc<watch::Sender<StreamingState>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(StreamingState::default());
        Self { tx: Arc::new(tx) }
    }

    /// Read-only handle for collaborators such as the caption controller.
    pub fn view(&self) -> StreamingView {
        StreamingView {
            rx: self.tx.subscribe(),
        }
    }

    /// Write handle lent to the playback controller and animation scheduler.
    pub(crate) fn writer(&self) -> StreamingWriter {
        StreamingWriter {
            tx: Arc::clone(&self.tx),
        }
    }

    pub fn current(&self) -> StreamingState {
        *self.tx.borrow()
    }
}

/// Write access to the flags, handed out only by [`SessionContext`].
#[derive(Debug, Clone)]
pub struct StreamingWriter {
    tx: Arc<watch::Sender<StreamingState>>,
}

impl StreamingWriter {
    pub fn set_streaming(&self, value: bool) {
        let changed = self.tx.send_if_modified(|s| {
            let changed = s.is_streaming != value;
            s.is_streaming = value;
            changed
        });
        if changed {
            debug!("session: is_streaming = {}", value);
        }
    }

    pub fn set_animating(&self, value: bool) {
        let changed = self.tx.send_if_modified(|s| {
            let changed = s.is_animating != value;
            s.is_animating = value;
            changed
        });
        if changed {
            debug!("session: is_animating = {}", value);
        }
    }

    pub fn reset(&self) {
        self.set_streaming(false);
        self.set_animating(false);
    }

    pub fn view(&self) -> StreamingView {
        StreamingView {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only view of the session flags.
#[derive(Debug, Clone)]
pub struct StreamingView {
    rx: watch::Receiver<StreamingState>,
}

impl StreamingView {
    pub fn current(&self) -> StreamingState {
        *self.rx.borrow()
    }

    pub fn is_streaming(&self) -> bool {
        self.current().is_streaming
    }

    pub fn is_animating(&self) -> bool {
        self.current().is_animating
    }

    /// Wait until speech starts, or fail with [`VoiceError::Timeout`].
    pub async fn wait_until_streaming(&self, limit: Duration) -> VoiceResult<()> {
        self.wait_for("speech to start", limit, |s| s.is_streaming).await
    }

    /// Wait until speech has stopped, or fail with [`VoiceError::Timeout`].
    pub async fn wait_until_quiet(&self, limit: Duration) -> VoiceResult<()> {
        self.wait_for("speech to stop", limit, |s| !s.is_streaming).await
    }

    async fn wait_for(
        &self,
        what: &str,
        limit: Duration,
        pred: impl FnMut(&StreamingState) -> bool,
    ) -> VoiceResult<()> {
        let mut rx = self.rx.clone();
        let result = match tokio::time::timeout(limit, rx.wait_for(pred)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(VoiceError::Playback("session context dropped".to_string())),
            Err(_) => Err(VoiceError::Timeout(what.to_string())),
        };
        result
    }
}
