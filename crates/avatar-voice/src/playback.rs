//! **Playback**: Decodes a speech clip, plays it, and exposes the streaming flag.
//!
//! The controller owns at most one active playback. `stop()` is the kill-switch: it halts
//! output, releases the audio context and clears `is_streaming`. Calling it again is a no-op.

use crate::error::{VoiceError, VoiceResult};
use crate::session::StreamingWriter;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Audio that decoded successfully and is ready to start.
#[derive(Debug, Clone)]
pub struct DecodedClip {
    pub bytes: Bytes,
    pub duration: Duration,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Turns encoded audio into something playable. Implement for a sound device or a test clock.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Decode a whole clip. Malformed input is a [`VoiceError::Decode`].
    async fn decode(&self, bytes: Bytes) -> VoiceResult<DecodedClip>;

    /// Start playing immediately.
    fn start(&self, clip: &DecodedClip) -> VoiceResult<Arc<dyn PlaybackHandle>>;
}

/// One started playback.
#[async_trait]
pub trait PlaybackHandle: Send + Sync {
    /// Resolves when the clip ends naturally.
    async fn finished(&self);

    /// Silence output now.
    fn halt(&self);

    /// Release the audio context. Called once per handle.
    fn release(&self);
}

/// How a `play` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Stopped,
}

struct ActivePlayback {
    id: u64,
    handle: Arc<dyn PlaybackHandle>,
    stop: Arc<Notify>,
}

/// Plays one clip at a time and keeps `is_streaming` in step with it.
pub struct AudioPlaybackController {
    backend: Arc<dyn AudioBackend>,
    streaming: StreamingWriter,
    active: Mutex<Option<ActivePlayback>>,
    next_id: AtomicU64,
}

impl AudioPlaybackController {
    pub fn new(backend: Arc<dyn AudioBackend>, streaming: StreamingWriter) -> Self {
        Self {
            backend,
            streaming,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Decode and play `bytes` until it finishes or [`stop`](Self::stop) is called.
    ///
    /// A decode failure halts anything still playing, clears the streaming flag and
    /// returns the error.
    pub async fn play(&self, bytes: Bytes) -> VoiceResult<PlaybackOutcome> {
        if bytes.is_empty() {
            return Err(VoiceError::Decode("empty audio buffer".to_string()));
        }
        // One clip at a time.
        self.stop();

        let clip = match self.backend.decode(bytes).await {
            Ok(clip) => clip,
            Err(e) => {
                warn!("playback: decode failed: {}", e);
                self.stop();
                self.streaming.set_streaming(false);
                return Err(e);
            }
        };

        let handle = match self.backend.start(&clip) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("playback: could not start output: {}", e);
                self.streaming.set_streaming(false);
                return Err(e);
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let stop = Arc::new(Notify::new());
        *self.active.lock() = Some(ActivePlayback {
            id,
            handle: Arc::clone(&handle),
            stop: Arc::clone(&stop),
        });
        self.streaming.set_streaming(true);
        info!(
            "🔊 playback: started {:?} clip ({} Hz, {} ch)",
            clip.duration, clip.sample_rate, clip.channels
        );

        tokio::select! {
            _ = handle.finished() => {
                let mine = {
                    let mut active = self.active.lock();
                    match active.as_ref() {
                        Some(a) if a.id == id => active.take(),
                        _ => None,
                    }
                };
                match mine {
                    Some(done) => {
                        done.handle.release();
                        self.streaming.set_streaming(false);
                        info!("playback: completed");
                        Ok(PlaybackOutcome::Completed)
                    }
                    // A halt can drain the output before the stop signal is observed.
                    None => Ok(PlaybackOutcome::Stopped),
                }
            }
            _ = stop.notified() => {
                debug!("playback: stopped before completion");
                Ok(PlaybackOutcome::Stopped)
            }
        }
    }

    /// Halt playback and release the audio context. Returns false when nothing was playing.
    pub fn stop(&self) -> bool {
        let Some(active) = self.active.lock().take() else {
            return false;
        };
        active.handle.halt();
        active.handle.release();
        self.streaming.set_streaming(false);
        active.stop.notify_one();
        info!("playback: stopped (interruption or manual)");
        true
    }

    pub fn is_playing(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Headless backend: parses WAV with `hound` and "plays" against the tokio clock.
#[derive(Debug, Default, Clone)]
pub struct ClockedBackend;

impl ClockedBackend {
    pub fn new() -> Self {
        Self
    }

    /// Parse a WAV header and compute its length.
    pub fn probe(bytes: &[u8]) -> VoiceResult<(Duration, u32, u16)> {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(VoiceError::Decode("WAV sample rate is zero".to_string()));
        }
        let frames = u64::from(reader.duration());
        let duration = Duration::from_millis(frames * 1000 / u64::from(spec.sample_rate));
        Ok((duration, spec.sample_rate, spec.channels))
    }
}

#[async_trait]
impl AudioBackend for ClockedBackend {
    async fn decode(&self, bytes: Bytes) -> VoiceResult<DecodedClip> {
        let (duration, sample_rate, channels) = Self::probe(&bytes)?;
        Ok(DecodedClip {
            bytes,
            duration,
            sample_rate,
            channels,
        })
    }

    fn start(&self, clip: &DecodedClip) -> VoiceResult<Arc<dyn PlaybackHandle>> {
        Ok(Arc::new(ClockedHandle {
            deadline: Instant::now() + clip.duration,
            halted: AtomicBool::new(false),
            released: AtomicBool::new(false),
            halt: Notify::new(),
        }))
    }
}

struct ClockedHandle {
    deadline: Instant,
    halted: AtomicBool,
    released: AtomicBool,
    halt: Notify,
}

#[async_trait]
impl PlaybackHandle for ClockedHandle {
    async fn finished(&self) {
        if self.halted.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => {}
            _ = self.halt.notified() => std::future::pending::<()>().await,
        }
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.halt.notify_waiters();
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("playback: audio context already released");
        }
    }
}
