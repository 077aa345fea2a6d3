//! # Avatar Voice - Talking Avatar Session Runtime
//!
//! Drives one interactive avatar session: synthesized speech is played back while the
//! avatar's mouth follows a viseme timeline, captions are revealed once audio starts, and
//! the candidate's spoken answer is captured and transcribed under a recording cap.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                       Avatar Orchestrator                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐     │
//! │  │  Synthesis   │→ │   Playback   │→ │ is_streaming (watch) │──┐  │
//! │  │ (HTTP/base64)│  │ (rodio/clock)│  └──────────────────────┘  │  │
//! │  └──────────────┘  └──────────────┘                            ↓  │
//! │         ↓          ┌──────────────┐  ┌──────────────────────┐     │
//! │  ┌──────────────┐  │  Animation   │  │   Caption Reveal     │     │
//! │  │   Preload    │→ │  Scheduler   │  │ (gated on streaming) │     │
//! │  │  (DashMap)   │  └──────────────┘  └──────────────────────┘     │
//! │  └──────────────┘                                                  │
//! └───────────────────────────────────────────────────────────────────┘
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                     Capture Session Manager                        │
//! │  Microphone (cpal) → Recognizer → Transcript   120 s cap → Usage   │
//! │  Secrets (retry, 429 is fatal)                                     │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

pub mod animation;
pub mod cancel;
pub mod caption;
pub mod capture;
pub mod config;
pub mod error;
pub mod http;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod orchestrator;
pub mod playback;
pub mod preload;
pub mod recognizer;
pub mod retry;
pub mod secrets;
pub mod session;

pub use animation::{
    AnimationFrame, AnimationReport, AnimationRun, AnimationScheduler, AnimationSequence,
    AvatarSurface, BlinkLoop, VisemeMark, MAX_SEQUENCE_MS,
};
pub use cancel::CancellationToken;
pub use caption::{CaptionBuffer, CaptionRevealController, CaptionSurface, RevealOutcome};
pub use capture::{
    CaptureSession, CaptureSessionManager, CaptureState, TimerDisplay, Transcript, UsageReporter,
};
pub use config::{AvatarConfig, BlinkConfig, CaptionConfig, CaptureConfig, RetryConfig};
pub use error::{VoiceError, VoiceResult};
pub use http::{
    HttpAssetSource, HttpEndpoint, HttpSecretSource, HttpSynthesisClient, HttpUsageReporter,
};
#[cfg(feature = "native-audio")]
pub use native::{CpalMicrophone, RodioBackend};
pub use orchestrator::{
    AvatarOrchestrator, AvatarPhase, RunOutcome, SynthesisClient, SynthesisPayload,
};
pub use playback::{
    AudioBackend, AudioPlaybackController, ClockedBackend, DecodedClip, PlaybackHandle,
    PlaybackOutcome,
};
pub use preload::{AssetPreloader, AssetSource, PreloadReport, PreloadStatus, PreloadedAsset};
pub use recognizer::{
    AudioChunk, Microphone, MicrophoneGrant, RecognitionEvent, RecognizerFactory,
    SpeechCredentials, SpeechRecognizer, TranscriptionRecognizerFactory,
};
pub use retry::{Backoff, RetryPolicy};
pub use secrets::{SecretRetriever, SecretSource};
pub use session::{SessionContext, StreamingState, StreamingView};
