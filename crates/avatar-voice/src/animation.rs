//! Viseme animation: timestamped mouth frames played against the tokio clock.
//!
//! One driver task per sequence applies frames in ascending offset order. The
//! [`CancellationToken`] is checked when scheduling, while waiting, and again right before
//! each display update; once cancelled the remaining frames are dropped and the neutral
//! reset runs at once.

use crate::cancel::CancellationToken;
use crate::config::BlinkConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::preload::{AssetPreloader, PreloadedAsset};
use crate::session::StreamingWriter;
use parking_lot::Mutex;
use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Minimum spacing between kept viseme marks.
pub const DEFAULT_VISEME_GAP_MS: f64 = 75.0;

/// Tail added after the last viseme so the final mouth shape is visible.
pub const VISEME_TAIL_MS: u64 = 120;

/// Longest offset or total duration a sequence may carry.
pub const MAX_SEQUENCE_MS: u64 = 120_000;

/// Upper bound on the head-motion period.
pub const MAX_HEAD_MOTION_PERIOD: Duration = Duration::from_millis(10_000);

/// One visual state change relative to sequence start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationFrame {
    #[serde(rename = "image", alias = "assetRef")]
    pub asset_ref: String,
    #[serde(rename = "timestamp", alias = "offsetMs", deserialize_with = "millis")]
    pub offset_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viseme_id: Option<u32>,
}

/// A viseme event reported by a speech synthesizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisemeMark {
    pub offset_ms: f64,
    pub viseme_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationSequence {
    pub frames: Vec<AnimationFrame>,
    #[serde(
        rename = "total_duration",
        alias = "totalDurationMs",
        deserialize_with = "millis"
    )]
    pub total_duration_ms: u64,
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(de::Error::custom(format!("invalid offset {}", value)));
    }
    let rounded = value.round();
    if rounded > MAX_SEQUENCE_MS as f64 {
        return Err(de::Error::custom(format!(
            "offset {} ms exceeds {} ms",
            value, MAX_SEQUENCE_MS
        )));
    }
    Ok(rounded as u64)
}

impl AnimationSequence {
    /// Parse the `animation` object of a synthesis payload and check its invariants.
    pub fn from_value(value: &serde_json::Value) -> VoiceResult<Self> {
        let seq: AnimationSequence = serde_json::from_value(value.clone())?;
        seq.validate()?;
        Ok(seq)
    }

    /// Build a timeline from raw viseme marks, thinning marks closer than `min_gap_ms`.
    pub fn from_visemes(marks: &[VisemeMark], min_gap_ms: f64) -> Self {
        let mut frames: Vec<AnimationFrame> = Vec::with_capacity(marks.len());
        let mut last_kept: Option<f64> = None;
        for mark in marks {
            if let Some(last) = last_kept {
                if mark.offset_ms - last < min_gap_ms {
                    continue;
                }
            }
            last_kept = Some(mark.offset_ms);
            frames.push(AnimationFrame {
                asset_ref: format!("{}.png", mark.viseme_id),
                offset_ms: mark.offset_ms.max(0.0).round() as u64,
                viseme_id: Some(mark.viseme_id),
            });
        }
        let total_duration_ms = frames
            .last()
            .map(|f| f.offset_ms + VISEME_TAIL_MS)
            .unwrap_or(0);
        Self {
            frames,
            total_duration_ms,
        }
    }

    /// Frames ascend by offset and the total covers the last frame.
    pub fn validate(&self) -> VoiceResult<()> {
        if let Some(pair) = self
            .frames
            .windows(2)
            .find(|pair| pair[1].offset_ms < pair[0].offset_ms)
        {
            return Err(VoiceError::InvalidSequence(format!(
                "frame at {} ms follows frame at {} ms",
                pair[1].offset_ms, pair[0].offset_ms
            )));
        }
        if let Some(frame) = self.frames.iter().find(|f| f.asset_ref.is_empty()) {
            return Err(VoiceError::InvalidSequence(format!(
                "frame at {} ms has no asset",
                frame.offset_ms
            )));
        }
        let last = self.frames.last().map(|f| f.offset_ms).unwrap_or(0);
        if self.total_duration_ms > MAX_SEQUENCE_MS {
            return Err(VoiceError::InvalidSequence(format!(
                "total duration {} ms exceeds {} ms",
                self.total_duration_ms, MAX_SEQUENCE_MS
            )));
        }
        if self.total_duration_ms < last {
            return Err(VoiceError::InvalidSequence(format!(
                "total duration {} ms ends before last frame at {} ms",
                self.total_duration_ms, last
            )));
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        Duration::from_millis(self.total_duration_ms)
    }

    /// Head-motion period: the clip length, capped at ten seconds.
    pub fn head_motion_period(&self) -> Duration {
        self.total_duration().min(MAX_HEAD_MOTION_PERIOD)
    }
}

/// The avatar display. Updates are synchronous and cheap.
pub trait AvatarSurface: Send + Sync {
    fn show_mouth(&self, asset: &PreloadedAsset);

    /// Neutral mouth, no pending visual state.
    fn reset_neutral(&self);

    /// Static layer (background, head, eyes overlay) shown once assets are loaded.
    fn show_layer(&self, _asset: &PreloadedAsset) {}

    fn start_head_motion(&self, _period: Duration) {}

    fn reset_head(&self) {}

    fn set_eyes_closed(&self, _closed: bool) {}
}

/// What one driver did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnimationReport {
    pub applied: usize,
    /// Frames dropped because the token was cancelled.
    pub suppressed: usize,
    /// Frames whose asset was missing from the cache.
    pub missing: usize,
    pub cancelled: bool,
}

/// Handle to a scheduled sequence.
#[derive(Debug)]
pub struct AnimationRun {
    done: oneshot::Receiver<AnimationReport>,
}

impl AnimationRun {
    /// Wait for the terminal reset. Fails with `Cancelled` if the driver was purged.
    pub async fn finished(self) -> VoiceResult<AnimationReport> {
        self.done.await.map_err(|_| VoiceError::Cancelled)
    }
}

pub struct AnimationScheduler {
    surface: Arc<dyn AvatarSurface>,
    assets: Arc<AssetPreloader>,
    animating: StreamingWriter,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl AnimationScheduler {
    pub fn new(
        surface: Arc<dyn AvatarSurface>,
        assets: Arc<AssetPreloader>,
        animating: StreamingWriter,
    ) -> Self {
        Self {
            surface,
            assets,
            animating,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Schedule every frame of `seq` plus the terminal reset.
    ///
    /// An already-cancelled token schedules nothing.
    pub fn schedule(
        &self,
        seq: AnimationSequence,
        token: CancellationToken,
    ) -> VoiceResult<AnimationRun> {
        seq.validate()?;
        if token.is_cancelled() {
            debug!("animation: token already cancelled, nothing scheduled");
            return Err(VoiceError::Cancelled);
        }

        let driver = FrameDriver {
            surface: Arc::clone(&self.surface),
            assets: Arc::clone(&self.assets),
            animating: self.animating.clone(),
            seq,
            token,
        };
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let report = driver.run().await;
            let _ = tx.send(report);
        });

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
        Ok(AnimationRun { done: rx })
    }

    /// Purge every not-yet-finished driver and restore the neutral display.
    pub fn clear(&self) -> usize {
        let purged = {
            let mut pending = self.pending.lock();
            let live = pending.iter().filter(|h| !h.is_finished()).count();
            for handle in pending.drain(..) {
                handle.abort();
            }
            live
        };
        if purged > 0 {
            debug!("animation: purged {} pending sequence(s)", purged);
        }
        self.surface.reset_neutral();
        self.surface.reset_head();
        self.animating.set_animating(false);
        purged
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().iter().any(|h| !h.is_finished())
    }
}

struct FrameDriver {
    surface: Arc<dyn AvatarSurface>,
    assets: Arc<AssetPreloader>,
    animating: StreamingWriter,
    seq: AnimationSequence,
    token: CancellationToken,
}

impl FrameDriver {
    async fn run(self) -> AnimationReport {
        let start = Instant::now();
        let mut report = AnimationReport::default();
        let total = self.seq.frames.len();

        self.animating.set_animating(true);
        self.surface.start_head_motion(self.seq.head_motion_period());
        debug!(
            "animation: {} frames over {} ms",
            total, self.seq.total_duration_ms
        );

        for (index, frame) in self.seq.frames.iter().enumerate() {
            let due = start + Duration::from_millis(frame.offset_ms);
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {}
                _ = tokio::time::sleep_until(due) => {}
            }
            // Fire-time check: the wait may have lost a race with cancel.
            if self.token.is_cancelled() {
                report.suppressed = total - index;
                report.cancelled = true;
                break;
            }
            match self.assets.get(&frame.asset_ref) {
                Some(asset) if !asset.is_revoked() => {
                    self.surface.show_mouth(&asset);
                    report.applied += 1;
                }
                _ => {
                    warn!("animation: asset {} not loaded, frame skipped", frame.asset_ref);
                    report.missing += 1;
                }
            }
        }

        if !report.cancelled {
            let end = start + self.seq.total_duration();
            tokio::select! {
                biased;
                _ = self.token.cancelled() => report.cancelled = true,
                _ = tokio::time::sleep_until(end) => {}
            }
        }

        self.surface.reset_neutral();
        self.surface.reset_head();
        self.animating.set_animating(false);
        info!(
            "animation: finished ({} applied, {} suppressed{})",
            report.applied,
            report.suppressed,
            if report.cancelled { ", cancelled" } else { "" }
        );
        report
    }
}

/// Idle eye blinks at random intervals until the token is cancelled.
pub struct BlinkLoop;

impl BlinkLoop {
    pub fn spawn(
        surface: Arc<dyn AvatarSurface>,
        config: BlinkConfig,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let min = config.min_interval_ms.min(config.max_interval_ms);
            let max = config.max_interval_ms.max(min);
            let closed_for = Duration::from_millis(config.duration_ms);
            debug!("blink: started ({}-{} ms)", min, max);
            loop {
                surface.set_eyes_closed(true);
                let opened = token.run_until_cancelled(tokio::time::sleep(closed_for)).await;
                surface.set_eyes_closed(false);
                if opened.is_err() {
                    break;
                }
                let next = Duration::from_millis(rand::thread_rng().gen_range(min..=max));
                if token
                    .run_until_cancelled(tokio::time::sleep(next))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!("blink: stopped");
        })
    }
}
