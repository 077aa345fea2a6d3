//! Avatar Orchestrator - sequences one spoken utterance on the avatar
//!
//! A run goes `FetchingSynthesis → WaitingPreload → AnimationDelay → Playing` and ends
//! `Completed`, `Cancelled` or `Failed`. The orchestrator owns the session flags and the
//! cancellation token of the current run; starting a new run supersedes the old one.

use crate::animation::{AnimationScheduler, AnimationSequence, AvatarSurface, BlinkLoop};
use crate::cancel::CancellationToken;
use crate::config::AvatarConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioBackend, AudioPlaybackController, PlaybackOutcome};
use crate::preload::{default_avatar_assets, AssetPreloader, PreloadReport};
use crate::session::{SessionContext, StreamingState, StreamingView};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Server bundle for one utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisPayload {
    /// Base64-encoded audio.
    pub audio: String,
    #[serde(default)]
    pub animation: serde_json::Value,
}

impl SynthesisPayload {
    pub fn audio_bytes(&self) -> VoiceResult<Bytes> {
        let raw = base64::engine::general_purpose::STANDARD.decode(self.audio.trim())?;
        Ok(Bytes::from(raw))
    }
}

/// Turns caption text into speech audio plus a viseme timeline.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<SynthesisPayload>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarPhase {
    Idle,
    FetchingSynthesis,
    WaitingPreload,
    AnimationDelay,
    Playing,
    Completed,
    Cancelled,
    Failed,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

struct ActiveRun {
    id: u64,
    token: CancellationToken,
}

/// Drives the avatar: synthesis, asset readiness, animation and audio.
pub struct AvatarOrchestrator {
    config: AvatarConfig,
    synthesis: Arc<dyn SynthesisClient>,
    preloader: Arc<AssetPreloader>,
    surface: Arc<dyn AvatarSurface>,
    context: SessionContext,
    playback: AudioPlaybackController,
    scheduler: AnimationScheduler,
    phase: watch::Sender<AvatarPhase>,
    current: Mutex<Option<ActiveRun>>,
    run_seq: AtomicU64,
    blink: Mutex<Option<CancellationToken>>,
}

impl AvatarOrchestrator {
    pub fn new(
        config: AvatarConfig,
        synthesis: Arc<dyn SynthesisClient>,
        preloader: Arc<AssetPreloader>,
        surface: Arc<dyn AvatarSurface>,
        audio: Arc<dyn AudioBackend>,
    ) -> Self {
        info!("🎭 Initializing Avatar Orchestrator (avatar: {})", config.avatar);
        let context = SessionContext::new();
        let playback = AudioPlaybackController::new(audio, context.writer());
        let scheduler = AnimationScheduler::new(
            Arc::clone(&surface),
            Arc::clone(&preloader),
            context.writer(),
        );
        let (phase, _rx) = watch::channel(AvatarPhase::Idle);
        Self {
            config,
            synthesis,
            preloader,
            surface,
            context,
            playback,
            scheduler,
            phase,
            current: Mutex::new(None),
            run_seq: AtomicU64::new(0),
            blink: Mutex::new(None),
        }
    }

    /// Load the avatar's asset set, show its static layers and start blinking.
    pub async fn prepare(&self) -> PreloadReport {
        let report = self.preloader.preload(&default_avatar_assets()).await;
        for layer in ["background.png", "head.png", "eyes-closed.png"] {
            match self.preloader.get(layer) {
                Some(asset) => self.surface.show_layer(&asset),
                None => warn!("orchestrator: layer {} unavailable", layer),
            }
        }
        self.surface.reset_neutral();
        if self.config.blink.enabled {
            self.start_blinking();
        }
        report
    }

    /// Speak `text` on the avatar and return once the audio has finished or the run was
    /// cancelled.
    ///
    /// Errors (network, decode, readiness timeout) leave the display neutral and the
    /// flags cleared.
    pub async fn stream_avatar(&self, text: &str) -> VoiceResult<RunOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::InvalidInput("nothing to speak".to_string()));
        }

        let (id, token) = self.begin_run();
        info!("🚀 orchestrator: run {} started ({} chars)", id, text.chars().count());

        let result = self.drive(text, &token).await;
        let owned = self.owns(id);

        let result = match result {
            Ok(PlaybackOutcome::Completed) => {
                if owned {
                    self.teardown();
                    self.set_phase(AvatarPhase::Completed);
                }
                info!("✅ orchestrator: run {} completed", id);
                Ok(RunOutcome::Completed)
            }
            Ok(PlaybackOutcome::Stopped) | Err(VoiceError::Cancelled) => {
                if owned {
                    self.teardown();
                    self.set_phase(AvatarPhase::Cancelled);
                }
                info!("orchestrator: run {} cancelled", id);
                Ok(RunOutcome::Cancelled)
            }
            Err(e) => {
                if owned {
                    self.teardown();
                    self.set_phase(AvatarPhase::Failed);
                }
                error!("orchestrator: run {} failed: {}", id, e);
                Err(e)
            }
        };

        self.finish_run(id);
        result
    }

    async fn drive(&self, text: &str, token: &CancellationToken) -> VoiceResult<PlaybackOutcome> {
        self.set_phase(AvatarPhase::FetchingSynthesis);
        let payload = token
            .run_until_cancelled(self.synthesis.synthesize(text))
            .await??;
        let audio = payload.audio_bytes()?;
        let animation = match AnimationSequence::from_value(&payload.animation) {
            Ok(seq) => Some(seq),
            Err(e) => {
                warn!("orchestrator: animation skipped, audio continues: {}", e);
                None
            }
        };

        self.set_phase(AvatarPhase::WaitingPreload);
        let loaded = token
            .run_until_cancelled(self.preloader.wait_ready(self.config.preload_timeout()))
            .await??;
        debug!("orchestrator: {} assets ready", loaded);

        self.set_phase(AvatarPhase::AnimationDelay);
        token
            .run_until_cancelled(tokio::time::sleep(self.config.settle_delay()))
            .await?;

        self.set_phase(AvatarPhase::Playing);
        if let Some(seq) = animation {
            match self.scheduler.schedule(seq, token.clone()) {
                Ok(run) => {
                    tokio::spawn(async move {
                        match run.finished().await {
                            Ok(report) if report.missing > 0 => warn!(
                                "orchestrator: {} of {} frames had no asset",
                                report.missing,
                                report.applied + report.missing
                            ),
                            Ok(report) => debug!("orchestrator: animation done {:?}", report),
                            Err(_) => debug!("orchestrator: animation torn down with the audio"),
                        }
                    });
                }
                Err(VoiceError::Cancelled) => return Err(VoiceError::Cancelled),
                Err(e) => warn!("orchestrator: animation rejected: {}", e),
            }
        }
        token.run_until_cancelled(self.playback.play(audio)).await?
    }

    /// Stop the current run.
    ///
    /// With `cancel_pending` the run's token is invalidated so nothing it queued fires
    /// later; without it only in-flight audio and animation are torn down. Returns false
    /// when there was nothing to stop.
    pub fn stop_avatar_stream(&self, cancel_pending: bool) -> bool {
        let token = self.current.lock().as_ref().map(|run| run.token.clone());
        let busy = token.is_some() || self.playback.is_playing() || self.scheduler.has_pending();
        if !busy {
            debug!("orchestrator: stop requested while idle");
            return false;
        }
        if cancel_pending {
            if let Some(token) = token {
                token.cancel();
            }
        }
        self.teardown();
        info!("orchestrator: avatar stream stopped (cancel_pending={})", cancel_pending);
        true
    }

    /// Stop everything and release the asset cache.
    pub fn shutdown(&self) {
        self.stop_avatar_stream(true);
        self.stop_blinking();
        let released = self.preloader.cleanup();
        info!("orchestrator: shut down, released {} assets", released);
    }

    pub fn start_blinking(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.blink.lock().replace(token.clone()) {
            previous.cancel();
        }
        BlinkLoop::spawn(Arc::clone(&self.surface), self.config.blink.clone(), token);
    }

    pub fn stop_blinking(&self) {
        if let Some(token) = self.blink.lock().take() {
            token.cancel();
        }
    }

    /// Read-only view of `{is_streaming, is_animating}` for collaborators.
    pub fn view(&self) -> StreamingView {
        self.context.view()
    }

    pub fn streaming_state(&self) -> StreamingState {
        self.context.current()
    }

    pub fn phase(&self) -> AvatarPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<AvatarPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().is_some()
    }

    fn begin_run(&self) -> (u64, CancellationToken) {
        let id = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        let previous = self.current.lock().replace(ActiveRun {
            id,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            info!("orchestrator: run {} supersedes run {}", id, previous.id);
            previous.token.cancel();
            self.teardown();
        }
        (id, token)
    }

    fn owns(&self, id: u64) -> bool {
        self.current.lock().as_ref().is_some_and(|run| run.id == id)
    }

    fn finish_run(&self, id: u64) {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|run| run.id == id) {
            current.take();
        }
    }

    /// Halt audio, purge animation, neutral display, flags cleared.
    fn teardown(&self) {
        self.playback.stop();
        self.scheduler.clear();
        self.context.writer().reset();
    }

    fn set_phase(&self, phase: AvatarPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!("orchestrator: {:?} -> {:?}", previous, phase);
        }
    }
}

impl Drop for AvatarOrchestrator {
    fn drop(&mut self) {
        self.stop_blinking();
        if let Some(run) = self.current.lock().take() {
            run.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_decodes_base64_audio() {
        let payload = SynthesisPayload {
            audio: base64::engine::general_purpose::STANDARD.encode(b"RIFF"),
            animation: serde_json::Value::Null,
        };
        assert_eq!(payload.audio_bytes().unwrap(), Bytes::from_static(b"RIFF"));
    }

    #[test]
    fn bad_base64_is_a_decode_failure() {
        let payload = SynthesisPayload {
            audio: "!!not base64!!".to_string(),
            animation: serde_json::Value::Null,
        };
        assert!(matches!(payload.audio_bytes(), Err(VoiceError::Decode(_))));
    }

    #[test]
    fn payload_without_animation_deserializes() {
        let payload: SynthesisPayload = serde_json::from_str(r#"{"audio": "AAAA"}"#).unwrap();
        assert!(payload.animation.is_null());
    }
}
