//! **Recognizer**: Microphone grant, continuous recognition and the transcription backend.
//!
//! The capture session talks to these traits only. [`TranscriptionRecognizer`] is the
//! built-in backend: it buffers PCM while listening and, when listening stops, uploads a
//! 16-bit WAV to an OpenAI-compatible `/audio/transcriptions` endpoint and reports the text
//! as a final result.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Subscription key and region for the recognizer service.
#[derive(Clone, PartialEq, Eq)]
pub struct SpeechCredentials {
    pub key: String,
    pub region: String,
}

impl fmt::Debug for SpeechCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpeechCredentials")
            .field("key", &"<redacted>")
            .field("region", &self.region)
            .finish()
    }
}

/// Recognizer callback, delivered over a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Partial hypothesis while speech is in progress.
    Recognizing(String),
    /// Final text for one utterance.
    Recognized(String),
}

/// Audio chunk from the capture device
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono samples normalized to -1.0..=1.0
    pub samples: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

/// An open microphone. The chunk stream is handed to whichever recognizer is built on it.
pub struct MicrophoneGrant {
    pub device: String,
    pub sample_rate: u32,
    chunks: Mutex<Option<mpsc::UnboundedReceiver<AudioChunk>>>,
}

impl fmt::Debug for MicrophoneGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrophoneGrant")
            .field("device", &self.device)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

impl MicrophoneGrant {
    pub fn new(
        device: impl Into<String>,
        sample_rate: u32,
        chunks: mpsc::UnboundedReceiver<AudioChunk>,
    ) -> Self {
        Self {
            device: device.into(),
            sample_rate,
            chunks: Mutex::new(Some(chunks)),
        }
    }

    /// A grant whose audio is consumed elsewhere (e.g. by a service-side SDK).
    pub fn without_stream(device: impl Into<String>, sample_rate: u32) -> Self {
        Self {
            device: device.into(),
            sample_rate,
            chunks: Mutex::new(None),
        }
    }

    /// Take the chunk stream. Only the first caller gets it.
    pub fn take_chunks(&self) -> Option<mpsc::UnboundedReceiver<AudioChunk>> {
        self.chunks.lock().take()
    }
}

/// Microphone access.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Ask for access. Denial or missing hardware is [`VoiceError::PermissionDenied`].
    async fn request_access(&self) -> VoiceResult<MicrophoneGrant>;

    /// Stop every track opened by `request_access`.
    fn release(&self) {}
}

/// A continuous recognizer bound to one microphone grant.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn start_continuous(&self) -> VoiceResult<()>;

    /// Stop capturing. Audio already captured may still yield a final result afterwards.
    async fn stop_continuous(&self) -> VoiceResult<()>;

    async fn close(&self);
}

/// Builds recognizers. Called once per construction attempt.
#[async_trait]
pub trait RecognizerFactory: Send + Sync {
    async fn create(
        &self,
        credentials: &SpeechCredentials,
        grant: &MicrophoneGrant,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<Arc<dyn SpeechRecognizer>>;
}

/// Encode mono f32 PCM as 16-bit WAV.
pub fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Factory for [`TranscriptionRecognizer`].
#[derive(Debug, Clone)]
pub struct TranscriptionRecognizerFactory {
    /// Base URL; `{region}` is replaced by the credential region.
    pub base_url: String,
    pub model: String,
    pub language: String,
    pub timeout: Duration,
}

impl TranscriptionRecognizerFactory {
    pub fn from_config(capture: &CaptureConfig, timeout: Duration) -> Self {
        Self {
            base_url: capture.transcription_url.clone(),
            model: capture.transcription_model.clone(),
            language: capture.language.clone(),
            timeout,
        }
    }
}

#[async_trait]
impl RecognizerFactory for TranscriptionRecognizerFactory {
    async fn create(
        &self,
        credentials: &SpeechCredentials,
        grant: &MicrophoneGrant,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<Arc<dyn SpeechRecognizer>> {
        if credentials.key.is_empty() {
            return Err(VoiceError::Recognizer("empty subscription key".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| VoiceError::Recognizer(e.to_string()))?;
        let base = self
            .base_url
            .replace("{region}", &credentials.region)
            .trim_end_matches('/')
            .to_string();
        let language = self
            .language
            .split(['-', '_'])
            .next()
            .unwrap_or("en")
            .to_string();

        let recognizer = Arc::new(TranscriptionRecognizer {
            client,
            url: format!("{}/audio/transcriptions", base),
            api_key: credentials.key.clone(),
            model: self.model.clone(),
            language,
            sample_rate: grant.sample_rate,
            events,
            buffer: Arc::new(Mutex::new(Vec::new())),
            capturing: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        });

        match grant.take_chunks() {
            Some(chunks) => {
                let pump = recognizer.spawn_pump(chunks);
                *recognizer.pump.lock() = Some(pump);
            }
            None => warn!("recognizer: microphone grant has no audio stream"),
        }
        info!("recognizer: transcription backend ready ({})", recognizer.url);
        Ok(recognizer)
    }
}

/// Buffers audio while listening, transcribes on stop.
pub struct TranscriptionRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    language: String,
    sample_rate: u32,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    buffer: Arc<Mutex<Vec<f32>>>,
    capturing: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptionRecognizer {
    fn spawn_pump(&self, mut chunks: mpsc::UnboundedReceiver<AudioChunk>) -> JoinHandle<()> {
        let buffer = Arc::clone(&self.buffer);
        let capturing = Arc::clone(&self.capturing);
        tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                if capturing.load(Ordering::SeqCst) {
                    buffer.lock().extend_from_slice(&chunk.samples);
                }
            }
            debug!("recognizer: audio stream closed");
        })
    }

    async fn transcribe(
        client: reqwest::Client,
        url: String,
        api_key: String,
        model: String,
        language: String,
        wav: Vec<u8>,
    ) -> VoiceResult<String> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", model)
            .text("language", language);
        let res = client
            .post(&url)
            .bearer_auth(&api_key)
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Recognizer(format!(
                "transcription API error {}: {}",
                status, body
            )));
        }
        let json: serde_json::Value = res.json().await?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[async_trait]
impl SpeechRecognizer for TranscriptionRecognizer {
    async fn start_continuous(&self) -> VoiceResult<()> {
        self.buffer.lock().clear();
        self.capturing.store(true, Ordering::SeqCst);
        debug!("recognizer: capturing");
        Ok(())
    }

    async fn stop_continuous(&self) -> VoiceResult<()> {
        if !self.capturing.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let samples = std::mem::take(&mut *self.buffer.lock());
        if samples.is_empty() {
            debug!("recognizer: nothing captured");
            return Ok(());
        }
        let seconds = samples.len() as f32 / self.sample_rate.max(1) as f32;
        let wav = pcm_to_wav(&samples, self.sample_rate)?;
        info!("recognizer: transcribing {:.1}s of audio", seconds);

        let events = self.events.clone();
        let job = Self::transcribe(
            self.client.clone(),
            self.url.clone(),
            self.api_key.clone(),
            self.model.clone(),
            self.language.clone(),
            wav,
        );
        tokio::spawn(async move {
            match job.await {
                Ok(text) if !text.is_empty() => {
                    let _ = events.send(RecognitionEvent::Recognized(text));
                }
                Ok(_) => debug!("recognizer: transcription was empty"),
                Err(e) => warn!("recognizer: transcription failed: {}", e),
            }
        });
        Ok(())
    }

    async fn close(&self) {
        self.capturing.store(false, Ordering::SeqCst);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.buffer.lock().clear();
        debug!("recognizer: closed");
    }
}
