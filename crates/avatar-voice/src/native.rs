//! Native audio I/O using Rodio and CPAL
//!
//! Output and input streams are not `Send`, so each lives on its own thread for as long as
//! it is needed. Only `Send` handles (`OutputStreamHandle`, `Sink`, channels) cross back.

use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioBackend, ClockedBackend, DecodedClip, PlaybackHandle};
use crate::recognizer::{AudioChunk, Microphone, MicrophoneGrant};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Plays speech on the default output device.
pub struct RodioBackend {
    handle: OutputStreamHandle,
    _keepalive: std_mpsc::Sender<()>,
}

impl RodioBackend {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        info!("🔊 Initializing audio playback");
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (keepalive, parked) = std_mpsc::channel::<()>();
        thread::Builder::new()
            .name("avatar-audio-out".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Hold the stream until the backend is dropped.
                    let _ = parked.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            })?;
        let handle = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("audio output thread exited".to_string()))??;
        info!("✅ Audio playback initialized");
        Ok(Self {
            handle,
            _keepalive: keepalive,
        })
    }
}

#[async_trait]
impl AudioBackend for RodioBackend {
    async fn decode(&self, bytes: Bytes) -> VoiceResult<DecodedClip> {
        let probe = bytes.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            let decoder = rodio::Decoder::new(Cursor::new(probe.clone()))
                .map_err(|e| VoiceError::Decode(e.to_string()))?;
            let sample_rate = decoder.sample_rate();
            let channels = decoder.channels();
            let duration = match decoder.total_duration() {
                Some(duration) => duration,
                None => ClockedBackend::probe(&probe)
                    .map(|(d, _, _)| d)
                    .unwrap_or(Duration::ZERO),
            };
            Ok::<_, VoiceError>((duration, sample_rate, channels))
        })
        .await
        .map_err(|e| VoiceError::Decode(e.to_string()))??;
        let (duration, sample_rate, channels) = decoded;
        Ok(DecodedClip {
            bytes,
            duration,
            sample_rate,
            channels,
        })
    }

    fn start(&self, clip: &DecodedClip) -> VoiceResult<Arc<dyn PlaybackHandle>> {
        let sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        let source = rodio::Decoder::new(Cursor::new(clip.bytes.clone()))
            .map_err(|e| VoiceError::Decode(e.to_string()))?;
        sink.append(source.convert_samples::<f32>());
        Ok(Arc::new(RodioHandle {
            sink: Arc::new(sink),
        }))
    }
}

struct RodioHandle {
    sink: Arc<Sink>,
}

#[async_trait]
impl PlaybackHandle for RodioHandle {
    async fn finished(&self) {
        let sink = Arc::clone(&self.sink);
        if let Err(e) = tokio::task::spawn_blocking(move || sink.sleep_until_end()).await {
            warn!("native: playback wait failed: {}", e);
        }
    }

    fn halt(&self) {
        self.sink.stop();
        info!("⏹️ Audio playback stopped");
    }

    fn release(&self) {
        self.sink.stop();
    }
}

/// Captures the default input device, downmixed to mono f32 chunks.
pub struct CpalMicrophone {
    /// Samples per chunk (e.g. 30 ms worth).
    pub chunk_ms: u32,
    streams: Mutex<Vec<std_mpsc::Sender<()>>>,
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self {
            chunk_ms: 30,
            streams: Mutex::new(Vec::new()),
        }
    }
}

impl CpalMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host()
            .input_devices()
            .map_err(|e| VoiceError::PermissionDenied(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn open(
        chunk_ms: u32,
        chunk_tx: mpsc::UnboundedSender<AudioChunk>,
    ) -> VoiceResult<(cpal::Stream, String, u32)> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("No input device available".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let supported = device.default_input_config()?;
        let sample_rate = supported.sample_rate().0;
        let channels = usize::from(supported.channels().max(1));
        let chunk_len = (sample_rate as usize * chunk_ms as usize / 1000).max(1);
        let config: cpal::StreamConfig = supported.config();
        debug!("native: input config {:?}", config);

        let mut pending: Vec<f32> = Vec::with_capacity(chunk_len);
        let mut push = move |mono: f32| {
            pending.push(mono);
            if pending.len() >= chunk_len {
                let chunk = AudioChunk {
                    samples: std::mem::take(&mut pending),
                    timestamp: chrono::Utc::now(),
                };
                if let Err(e) = chunk_tx.send(chunk) {
                    debug!("native: audio chunk dropped: {}", e);
                }
            }
        };
        let on_error = |err: cpal::StreamError| warn!("Audio stream error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        push(frame.iter().sum::<f32>() / frame.len() as f32);
                    }
                },
                on_error,
                None,
            )?,
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        let sum: f32 = frame.iter().map(|&s| f32::from(s) / 32768.0).sum();
                        push(sum / frame.len() as f32);
                    }
                },
                on_error,
                None,
            )?,
            other => {
                return Err(VoiceError::PermissionDenied(format!(
                    "unsupported input sample format {:?}",
                    other
                )))
            }
        };
        stream.play()?;
        Ok((stream, name, sample_rate))
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn request_access(&self) -> VoiceResult<MicrophoneGrant> {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let chunk_ms = self.chunk_ms;
        thread::Builder::new()
            .name("avatar-audio-in".to_string())
            .spawn(move || match Self::open(chunk_ms, chunk_tx) {
                Ok((stream, name, rate)) => {
                    let _ = ready_tx.send(Ok((name, rate)));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })?;
        let (device, sample_rate) = ready_rx
            .await
            .map_err(|_| VoiceError::PermissionDenied("audio input thread exited".to_string()))??;
        self.streams.lock().push(stop_tx);
        info!("✅ Audio capture started on {} ({} Hz)", device, sample_rate);
        Ok(MicrophoneGrant::new(device, sample_rate, chunk_rx))
    }

    fn release(&self) {
        let streams: Vec<_> = self.streams.lock().drain(..).collect();
        for stop in streams {
            let _ = stop.send(());
        }
        info!("native: microphone released");
    }
}
