//! Fakes shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use avatar_voice::{
    AssetSource, AvatarSurface, CaptionSurface, Microphone, MicrophoneGrant, PreloadedAsset,
    RecognitionEvent, RecognizerFactory, SecretSource, SpeechCredentials, SpeechRecognizer,
    SynthesisClient, SynthesisPayload, TimerDisplay, UsageReporter, VoiceError, VoiceResult,
};
use base64::Engine;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Honors `RUST_LOG`, warnings otherwise.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// 16 kHz mono silence of the given length.
pub fn wav(ms: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for _ in 0..(16 * ms) {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    Mouth(String),
    Neutral,
    Layer(String),
    HeadMotion(Duration),
    ResetHead,
    Eyes(bool),
}

/// Records every display update with the (paused) clock offset it happened at.
pub struct FakeSurface {
    origin: Instant,
    events: Mutex<Vec<(Duration, SurfaceEvent)>>,
}

impl FakeSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            origin: Instant::now(),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Offset of the paused clock from when the surface was created.
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn push(&self, event: SurfaceEvent) {
        self.events.lock().push((self.origin.elapsed(), event));
    }

    pub fn events(&self) -> Vec<(Duration, SurfaceEvent)> {
        self.events.lock().clone()
    }

    /// Mouth updates only, as (offset from `since`, asset name).
    pub fn mouths_since(&self, since: Duration) -> Vec<(Duration, String)> {
        self.events()
            .into_iter()
            .filter_map(|(at, event)| match event {
                SurfaceEvent::Mouth(name) if at >= since => Some((at - since, name)),
                _ => None,
            })
            .collect()
    }

    pub fn last(&self) -> Option<SurfaceEvent> {
        self.events.lock().last().map(|(_, e)| e.clone())
    }

    pub fn blinks(&self) -> usize {
        self.events()
            .iter()
            .filter(|(_, e)| *e == SurfaceEvent::Eyes(true))
            .count()
    }
}

impl AvatarSurface for FakeSurface {
    fn show_mouth(&self, asset: &PreloadedAsset) {
        self.push(SurfaceEvent::Mouth(asset.name().to_string()));
    }

    fn reset_neutral(&self) {
        self.push(SurfaceEvent::Neutral);
    }

    fn show_layer(&self, asset: &PreloadedAsset) {
        self.push(SurfaceEvent::Layer(asset.name().to_string()));
    }

    fn start_head_motion(&self, period: Duration) {
        self.push(SurfaceEvent::HeadMotion(period));
    }

    fn reset_head(&self) {
        self.push(SurfaceEvent::ResetHead);
    }

    fn set_eyes_closed(&self, closed: bool) {
        self.push(SurfaceEvent::Eyes(closed));
    }
}

/// Serves every asset except the ones listed as failing.
pub struct FakeAssetSource {
    failing: HashSet<String>,
    pub loads: AtomicUsize,
}

impl FakeAssetSource {
    pub fn new() -> Arc<Self> {
        Self::failing(&[])
    }

    pub fn failing(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            failing: names.iter().map(|n| n.to_string()).collect(),
            loads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl AssetSource for FakeAssetSource {
    async fn load(&self, name: &str, _cache_bust: &str) -> VoiceResult<bytes::Bytes> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(name) {
            return Err(VoiceError::Network(format!("404 for {}", name)));
        }
        Ok(bytes::Bytes::from(format!("png:{}", name)))
    }
}

/// Returns a fixed clip and timeline after an optional server delay.
pub struct FakeSynthesis {
    pub audio: String,
    pub animation: serde_json::Value,
    pub delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSynthesis {
    pub fn new(audio_ms: u32, animation: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            audio: base64::engine::general_purpose::STANDARD.encode(wav(audio_ms)),
            animation,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn with_audio(audio: String, animation: serde_json::Value) -> Arc<Self> {
        Arc::new(Self {
            audio,
            animation,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn delayed(audio_ms: u32, animation: serde_json::Value, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            audio: base64::engine::general_purpose::STANDARD.encode(wav(audio_ms)),
            animation,
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SynthesisClient for FakeSynthesis {
    async fn synthesize(&self, text: &str) -> VoiceResult<SynthesisPayload> {
        self.calls.lock().push(text.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(SynthesisPayload {
            audio: self.audio.clone(),
            animation: self.animation.clone(),
        })
    }
}

pub fn timeline(frames: &[(&str, u64)], total_ms: u64) -> serde_json::Value {
    let frames: Vec<_> = frames
        .iter()
        .map(|(image, at)| serde_json::json!({ "image": image, "timestamp": *at as f64 }))
        .collect();
    serde_json::json!({ "frames": frames, "total_duration": total_ms as f64 })
}

pub struct FakeMicrophone {
    allow: bool,
    pub requests: AtomicUsize,
    pub releases: AtomicUsize,
}

impl FakeMicrophone {
    pub fn allowing() -> Arc<Self> {
        Arc::new(Self {
            allow: true,
            requests: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn denying() -> Arc<Self> {
        Arc::new(Self {
            allow: false,
            requests: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn request_access(&self) -> VoiceResult<MicrophoneGrant> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.allow {
            Ok(MicrophoneGrant::without_stream("fake mic", 16_000))
        } else {
            Err(VoiceError::PermissionDenied("NotAllowedError".to_string()))
        }
    }

    fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted replies per key; once a key's script runs out it answers with `fallback`.
pub struct FakeSecretSource {
    scripts: Mutex<HashMap<String, VecDeque<VoiceResult<String>>>>,
    fallback: fn(&str) -> VoiceResult<String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeSecretSource {
    pub fn valid() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: |key| Ok(format!("value-of-{}", key)),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: |_| Err(VoiceError::Network("HTTP 500".to_string())),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn rate_limited() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: |key| Err(VoiceError::RateLimited(key.to_string())),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn script(self: &Arc<Self>, key: &str, replies: Vec<VoiceResult<String>>) {
        self.scripts
            .lock()
            .insert(key.to_string(), replies.into_iter().collect());
    }

    pub fn calls_for(&self, key: &str) -> usize {
        self.calls.lock().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl SecretSource for FakeSecretSource {
    async fn fetch(&self, key: &str) -> VoiceResult<String> {
        self.calls.lock().push(key.to_string());
        let scripted = self
            .scripts
            .lock()
            .get_mut(key)
            .and_then(|replies| replies.pop_front());
        match scripted {
            Some(reply) => reply,
            None => (self.fallback)(key),
        }
    }
}

/// Emits one final result per stop, like a service that flushes on session end.
pub struct FakeRecognizer {
    events: mpsc::UnboundedSender<RecognitionEvent>,
    final_text: String,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeRecognizer {
    pub fn emit(&self, event: RecognitionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl SpeechRecognizer for FakeRecognizer {
    async fn start_continuous(&self) -> VoiceResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_continuous(&self) -> VoiceResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.final_text.is_empty() {
            let _ = self
                .events
                .send(RecognitionEvent::Recognized(self.final_text.clone()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeRecognizerFactory {
    final_text: String,
    failures_before_success: AtomicUsize,
    pub attempts: AtomicUsize,
    pub credentials: Mutex<Option<SpeechCredentials>>,
    pub built: Mutex<Option<Arc<FakeRecognizer>>>,
}

impl FakeRecognizerFactory {
    pub fn new(final_text: &str) -> Arc<Self> {
        Self::flaky(final_text, 0)
    }

    pub fn flaky(final_text: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            final_text: final_text.to_string(),
            failures_before_success: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            credentials: Mutex::new(None),
            built: Mutex::new(None),
        })
    }

    pub fn recognizer(&self) -> Arc<FakeRecognizer> {
        self.built.lock().clone().expect("recognizer not built")
    }
}

#[async_trait]
impl RecognizerFactory for FakeRecognizerFactory {
    async fn create(
        &self,
        credentials: &SpeechCredentials,
        _grant: &MicrophoneGrant,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<Arc<dyn SpeechRecognizer>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_before_success.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_before_success.store(remaining - 1, Ordering::SeqCst);
            return Err(VoiceError::Recognizer("service unavailable".to_string()));
        }
        *self.credentials.lock() = Some(credentials.clone());
        let recognizer = Arc::new(FakeRecognizer {
            events,
            final_text: self.final_text.clone(),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        *self.built.lock() = Some(Arc::clone(&recognizer));
        Ok(recognizer)
    }
}

#[derive(Default)]
pub struct FakeUsageReporter {
    pub reports: Mutex<Vec<u64>>,
}

impl FakeUsageReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reports(&self) -> Vec<u64> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl UsageReporter for FakeUsageReporter {
    async fn report(&self, recording_seconds: u64) -> VoiceResult<()> {
        self.reports.lock().push(recording_seconds);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTimerDisplay {
    pub shown: Mutex<Vec<u64>>,
    pub clears: AtomicUsize,
}

impl TimerDisplay for FakeTimerDisplay {
    fn show_remaining(&self, seconds: u64) {
        self.shown.lock().push(seconds);
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeCaptionSurface {
    pub renders: Mutex<Vec<String>>,
    pub controls: Mutex<Vec<bool>>,
}

impl FakeCaptionSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_render(&self) -> String {
        self.renders.lock().last().cloned().unwrap_or_default()
    }

    pub fn controls_enabled(&self) -> Option<bool> {
        self.controls.lock().last().copied()
    }
}

impl CaptionSurface for FakeCaptionSurface {
    fn render(&self, markup: &str) {
        self.renders.lock().push(markup.to_string());
    }

    fn set_controls_enabled(&self, enabled: bool) {
        self.controls.lock().push(enabled);
    }
}
