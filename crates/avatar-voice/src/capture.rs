//! **Capture session**: Microphone permission, recognizer lifecycle, listening and timers.
//!
//! ```text
//! Uninitialized → PermissionPending → Initializing → Ready ⇄ Listening → Stopping → Ready
//!                                                   any state → ShutDown (terminal)
//! ```
//!
//! Listening arms a hard cap (`MAX_RECORDING_TIME`) that force-stops it. `start_timer`
//! adds an optional countdown that updates a remaining-time display once per second and
//! also force-stops on expiry. Stopping waits a short grace period for the final result,
//! then reports the recording duration once.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::{
    Microphone, MicrophoneGrant, RecognitionEvent, RecognizerFactory, SpeechRecognizer,
};
use crate::secrets::{SecretRetriever, SecretSource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Attempts for secret retrieval and recognizer construction.
pub const MAX_RETRIES: u32 = 3;

/// Hard cap on one listening period.
pub const MAX_RECORDING_TIME: Duration = Duration::from_millis(120_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Uninitialized,
    PermissionPending,
    Initializing,
    Ready,
    Listening,
    Stopping,
    ShutDown,
}

/// Lifecycle record owned by the manager.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub state: CaptureState,
    pub recording_start: Option<Instant>,
    pub max_duration: Duration,
}

/// Live recognition text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    /// Final results, each followed by a space.
    pub text: String,
    /// Current partial hypothesis.
    pub partial: String,
}

impl Transcript {
    pub fn display(&self) -> String {
        format!("{}{}", self.text, self.partial)
    }
}

/// Usage accounting endpoint.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    async fn report(&self, recording_seconds: u64) -> VoiceResult<()>;
}

/// Remaining-time display for the countdown timer.
pub trait TimerDisplay: Send + Sync {
    fn show_remaining(&self, seconds: u64);
    fn clear(&self);
}

/// Owns one capture session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct CaptureSessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: CaptureConfig,
    microphone: Arc<dyn Microphone>,
    secrets: SecretRetriever,
    factory: Arc<dyn RecognizerFactory>,
    usage: Arc<dyn UsageReporter>,
    display: Mutex<Option<Arc<dyn TimerDisplay>>>,
    session: Mutex<CaptureSession>,
    grant: Mutex<Option<Arc<MicrophoneGrant>>>,
    recognizer: Mutex<Option<Arc<dyn SpeechRecognizer>>>,
    transcript: watch::Sender<Transcript>,
    final_tx: Mutex<Option<oneshot::Sender<()>>>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
    cap_timer: Mutex<Option<JoinHandle<()>>>,
    countdown: Mutex<Option<JoinHandle<()>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl CaptureSessionManager {
    pub fn new(
        config: CaptureConfig,
        microphone: Arc<dyn Microphone>,
        secrets: Arc<dyn SecretSource>,
        factory: Arc<dyn RecognizerFactory>,
        usage: Arc<dyn UsageReporter>,
    ) -> Self {
        let retriever = SecretRetriever::new(secrets, config.secret_retry.policy());
        let session = CaptureSession {
            state: CaptureState::Uninitialized,
            recording_start: None,
            max_duration: config.max_recording(),
        };
        let (transcript, _rx) = watch::channel(Transcript::default());
        Self {
            inner: Arc::new(Inner {
                config,
                microphone,
                secrets: retriever,
                factory,
                usage,
                display: Mutex::new(None),
                session: Mutex::new(session),
                grant: Mutex::new(None),
                recognizer: Mutex::new(None),
                transcript,
                final_tx: Mutex::new(None),
                event_pump: Mutex::new(None),
                cap_timer: Mutex::new(None),
                countdown: Mutex::new(None),
                init_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_timer_display(&self, display: Arc<dyn TimerDisplay>) {
        *self.inner.display.lock() = Some(display);
    }

    /// Ask for the microphone. Denial is [`VoiceError::PermissionDenied`]: not fatal, the
    /// caller can carry on without capture.
    pub async fn request_microphone_permission(&self) -> VoiceResult<()> {
        {
            let mut session = self.inner.session.lock();
            match session.state {
                CaptureState::ShutDown => return Err(VoiceError::ShutDown),
                CaptureState::Uninitialized | CaptureState::PermissionPending => {
                    session.state = CaptureState::PermissionPending;
                }
                _ => return Ok(()),
            }
        }
        if self.inner.grant.lock().is_some() {
            return Ok(());
        }

        match self.inner.microphone.request_access().await {
            Ok(grant) => {
                info!("🎤 capture: microphone granted ({} @ {} Hz)", grant.device, grant.sample_rate);
                if self.state() == CaptureState::ShutDown {
                    self.inner.microphone.release();
                    return Err(VoiceError::ShutDown);
                }
                *self.inner.grant.lock() = Some(Arc::new(grant));
                Ok(())
            }
            Err(e) => {
                warn!("capture: microphone unavailable, continuing without capture: {}", e);
                let reason = match e {
                    VoiceError::PermissionDenied(reason) => reason,
                    other => other.to_string(),
                };
                Err(VoiceError::PermissionDenied(reason))
            }
        }
    }

    /// Fetch credentials and build the recognizer. A no-op once ready.
    ///
    /// Secret or construction failures shut the session down and are returned; check
    /// [`VoiceError::is_fatal`] to decide whether to end the whole session.
    pub async fn initialize(&self) -> VoiceResult<()> {
        let _init = self.inner.init_lock.lock().await;
        match self.state() {
            CaptureState::ShutDown => return Err(VoiceError::ShutDown),
            CaptureState::Ready | CaptureState::Listening | CaptureState::Stopping => {
                return Ok(())
            }
            _ => {}
        }
        let grant = self.inner.grant.lock().clone().ok_or_else(|| {
            VoiceError::PermissionDenied("microphone permission not granted".to_string())
        })?;
        self.set_state(CaptureState::Initializing);
        info!("capture: initializing recognizer");

        let credentials = match self.inner.secrets.speech_credentials().await {
            Ok(credentials) => credentials,
            Err(e) => {
                error!("capture: could not retrieve credentials: {}", e);
                self.shutdown().await;
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let factory = &self.inner.factory;
        let built = self
            .inner
            .config
            .init_policy()
            .run("recognizer init", |attempt| {
                let events = events_tx.clone();
                let grant = &grant;
                let credentials = &credentials;
                async move {
                    debug!("capture: recognizer construction attempt {}", attempt);
                    factory.create(credentials, grant, events).await
                }
            })
            .await;
        let recognizer = match built {
            Ok(recognizer) => recognizer,
            Err(e) => {
                error!("❌ capture: recognizer construction failed: {}", e);
                self.shutdown().await;
                return Err(e);
            }
        };

        let still_initializing = {
            let mut session = self.inner.session.lock();
            let current = session.state == CaptureState::Initializing;
            if current {
                session.state = CaptureState::Ready;
            }
            current
        };
        if !still_initializing {
            recognizer.close().await;
            return Err(VoiceError::ShutDown);
        }
        *self.inner.recognizer.lock() = Some(recognizer);
        let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), events_rx));
        if let Some(old) = self.inner.event_pump.lock().replace(pump) {
            old.abort();
        }
        info!("✅ capture: recognizer ready");
        Ok(())
    }

    /// Start continuous recognition, initializing first if needed, and arm the hard cap.
    ///
    /// Already listening is a no-op; a stop still in progress is an error.
    pub async fn start_listening(&self) -> VoiceResult<()> {
        if !self.is_initialized() {
            self.initialize().await?;
        }
        match self.state() {
            CaptureState::ShutDown => return Err(VoiceError::ShutDown),
            CaptureState::Listening => return Ok(()),
            CaptureState::Stopping => {
                return Err(VoiceError::Recognizer(
                    "previous recording is still stopping".to_string(),
                ))
            }
            _ => {}
        }
        let recognizer = self
            .inner
            .recognizer
            .lock()
            .clone()
            .ok_or_else(|| VoiceError::Recognizer("recognizer not initialized".to_string()))?;

        recognizer.start_continuous().await?;
        {
            let mut session = self.inner.session.lock();
            if session.state != CaptureState::Ready {
                return Err(VoiceError::ShutDown);
            }
            session.state = CaptureState::Listening;
            session.recording_start = Some(Instant::now());
        }
        self.inner.transcript.send_modify(|t| t.partial.clear());

        let cap = self.inner.config.max_recording();
        let weak = Arc::downgrade(&self.inner);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(cap).await;
            if let Some(inner) = weak.upgrade() {
                info!(
                    "capture: recording automatically stopped after {} seconds",
                    cap.as_secs()
                );
                spawn_stop(CaptureSessionManager { inner });
            }
        });
        if let Some(old) = self.inner.cap_timer.lock().replace(timer) {
            old.abort();
        }
        info!("🎙️ capture: listening");
        Ok(())
    }

    /// Stop listening, wait briefly for the final result and report usage.
    ///
    /// Returns the billed duration in whole seconds, or `None` if nothing was listening.
    pub async fn stop_listening(&self) -> VoiceResult<Option<u64>> {
        let (final_tx, final_rx) = oneshot::channel();
        let started = {
            let mut session = self.inner.session.lock();
            if session.state != CaptureState::Listening {
                return Ok(None);
            }
            session.state = CaptureState::Stopping;
            *self.inner.final_tx.lock() = Some(final_tx);
            session.recording_start.take()
        };
        let seconds = started.map(|t| ceil_secs(t.elapsed()));
        abort_slot(&self.inner.cap_timer);

        let recognizer = self.inner.recognizer.lock().clone();
        if let Some(recognizer) = recognizer {
            if let Err(e) = recognizer.stop_continuous().await {
                warn!("capture: failed to stop recognition: {}", e);
            }
        }

        match tokio::time::timeout(self.inner.config.final_result_grace(), final_rx).await {
            Ok(Ok(())) => debug!("capture: final result received"),
            Ok(Err(_)) => debug!("capture: stop interrupted by shutdown"),
            Err(_) => warn!("capture: recognition timeout - no final results"),
        }
        self.inner.final_tx.lock().take();

        {
            let mut session = self.inner.session.lock();
            if session.state == CaptureState::Stopping {
                session.state = CaptureState::Ready;
            }
        }
        self.inner.transcript.send_modify(|t| t.partial.clear());

        if let Some(seconds) = seconds {
            info!("capture: stopped after {}s", seconds);
            if let Err(e) = self.inner.usage.report(seconds).await {
                error!("capture: error reporting recording duration: {}", e);
            }
        }
        Ok(seconds)
    }

    /// Countdown that force-stops listening. Ignored while one is already running.
    pub fn start_timer(&self, duration: Duration) {
        if self.is_timer_running() || self.state() == CaptureState::ShutDown {
            return;
        }
        let display = self.inner.display.lock().clone();
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let start = Instant::now();
            let deadline = start + duration;
            let second = Duration::from_secs(1);
            let mut ticker = tokio::time::interval_at(start + second, second);
            loop {
                tokio::select! {
                    biased;
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = ticker.tick() => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if let Some(display) = &display {
                            display.show_remaining(ceil_secs(remaining));
                        }
                    }
                }
            }
            if let Some(display) = &display {
                display.clear();
            }
            if let Some(inner) = weak.upgrade() {
                let manager = CaptureSessionManager { inner };
                if manager.is_listening() {
                    info!("capture: countdown expired, stopping");
                    spawn_stop(manager);
                }
            }
        });
        *self.inner.countdown.lock() = Some(task);
        debug!("capture: countdown started ({:?})", duration);
    }

    pub fn stop_timer(&self) {
        abort_slot(&self.inner.countdown);
        let display = self.inner.display.lock().clone();
        if let Some(display) = display {
            display.clear();
        }
    }

    pub fn is_timer_running(&self) -> bool {
        self.inner
            .countdown
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Release the recognizer, the microphone and every timer. Terminal and idempotent.
    pub async fn shutdown(&self) -> bool {
        {
            let mut session = self.inner.session.lock();
            if session.state == CaptureState::ShutDown {
                return false;
            }
            session.state = CaptureState::ShutDown;
            session.recording_start = None;
        }
        abort_slot(&self.inner.cap_timer);
        abort_slot(&self.inner.event_pump);
        self.stop_timer();
        self.inner.final_tx.lock().take();

        let recognizer = self.inner.recognizer.lock().take();
        if let Some(recognizer) = recognizer {
            if let Err(e) = recognizer.stop_continuous().await {
                warn!("capture: failed to stop recognition: {}", e);
            }
            recognizer.close().await;
        }
        let grant = self.inner.grant.lock().take();
        if grant.is_some() {
            self.inner.microphone.release();
        }
        info!("🛑 capture: session shut down");
        true
    }

    pub fn state(&self) -> CaptureState {
        self.inner.session.lock().state
    }

    pub fn session(&self) -> CaptureSession {
        self.inner.session.lock().clone()
    }

    pub fn is_listening(&self) -> bool {
        self.state() == CaptureState::Listening
    }

    pub fn is_initialized(&self) -> bool {
        matches!(
            self.state(),
            CaptureState::Ready | CaptureState::Listening | CaptureState::Stopping
        )
    }

    pub fn has_permission(&self) -> bool {
        self.inner.grant.lock().is_some()
    }

    pub fn transcript(&self) -> Transcript {
        self.inner.transcript.borrow().clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Transcript> {
        self.inner.transcript.subscribe()
    }

    pub fn clear_transcript(&self) {
        self.inner.transcript.send_replace(Transcript::default());
    }

    fn set_state(&self, state: CaptureState) {
        let mut session = self.inner.session.lock();
        if session.state != CaptureState::ShutDown {
            debug!("capture: {:?} -> {:?}", session.state, state);
            session.state = state;
        }
    }
}

impl Inner {
    fn on_event(&self, event: RecognitionEvent) {
        let state = self.session.lock().state;
        match event {
            RecognitionEvent::Recognizing(text) => {
                if state == CaptureState::Listening {
                    self.transcript.send_modify(|t| t.partial = text);
                } else if !text.is_empty() {
                    debug!("capture: speech being detected while not listening");
                }
            }
            RecognitionEvent::Recognized(text) => match state {
                CaptureState::Listening | CaptureState::Stopping => {
                    let text = text.trim();
                    self.transcript.send_modify(|t| {
                        if !text.is_empty() {
                            t.text.push_str(text);
                            t.text.push(' ');
                        }
                        t.partial.clear();
                    });
                    if state == CaptureState::Stopping {
                        if let Some(tx) = self.final_tx.lock().take() {
                            let _ = tx.send(());
                        }
                    }
                }
                _ => {
                    if !text.is_empty() {
                        warn!("capture: speech detected while not in listening mode");
                    }
                }
            },
        }
    }
}

async fn pump_events(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<RecognitionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(strong) = inner.upgrade() else {
            break;
        };
        strong.on_event(event);
    }
    debug!("capture: recognition event stream ended");
}

/// Timers stop listening from a separate task so disarming them never cancels the stop.
fn spawn_stop(manager: CaptureSessionManager) {
    tokio::spawn(async move {
        if let Err(e) = manager.stop_listening().await {
            warn!("capture: automatic stop failed: {}", e);
        }
    });
}

fn abort_slot(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().take() {
        task.abort();
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let millis = d.as_millis();
    ((millis + 999) / 1000) as u64
}
