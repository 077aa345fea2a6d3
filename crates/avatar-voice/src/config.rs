//! Avatar session configuration.
//!
//! Built explicitly at session start and handed to each component; nothing here is global.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | AVATAR_CONFIG | config/avatar | Optional TOML file layered over the defaults. |
//! | AVATAR__SERVER_URL | http://127.0.0.1:5000 | Base URL of the session server. |
//! | AVATAR__AVATAR | default | Asset directory of the avatar to preload. |
//! | AVATAR__SETTLE_DELAY_MS | 1000 | Pause between asset readiness and playback. |
//! | AVATAR__CAPTURE__MAX_RECORDING_MS | 120000 | Hard cap on one listening period. |

use crate::error::{VoiceError, VoiceResult};
use crate::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one avatar session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    /// Base URL for synthesis, secrets, assets and usage endpoints.
    pub server_url: String,
    /// Avatar name; selects the asset directory `/static/assets/images/{avatar}/`.
    pub avatar: String,
    /// Delay between asset readiness and playback so the caller's UI can settle.
    pub settle_delay_ms: u64,
    /// Upper bound on waiting for the preloader to report readiness.
    pub preload_timeout_ms: u64,
    /// Timeout applied to every HTTP request.
    pub request_timeout_secs: u64,
    pub caption: CaptionConfig,
    pub capture: CaptureConfig,
    pub blink: BlinkConfig,
}

/// Caption reveal tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub reveal_speed_ms_per_char: u64,
    /// Pause after the reveal (and speech) ends before controls come back.
    pub grace_delay_ms: u64,
    /// Visible characters beyond this are cut off.
    pub max_visible_chars: usize,
    /// Upper bound on waiting for speech to start or stop.
    pub stream_wait_timeout_ms: u64,
}

/// Speech capture tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Listening is force-stopped after this long.
    pub max_recording_ms: u64,
    /// How long stopping waits for a final recognition result.
    pub final_result_grace_ms: u64,
    /// Recognizer construction attempts (no delay between them).
    pub init_attempts: u32,
    /// Retry policy for each secret fetch.
    pub secret_retry: RetryConfig,
    /// OpenAI-compatible transcription endpoint used by the default recognizer.
    pub transcription_url: String,
    pub transcription_model: String,
    pub language: String,
}

/// Serializable form of a [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Zero disables the delay between attempts.
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

/// Idle eye-blink timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlinkConfig {
    pub enabled: bool,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub duration_ms: u64,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:5000".to_string(),
            avatar: "default".to_string(),
            settle_delay_ms: 1000,
            preload_timeout_ms: 15_000,
            request_timeout_secs: 30,
            caption: CaptionConfig::default(),
            capture: CaptureConfig::default(),
            blink: BlinkConfig::default(),
        }
    }
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            reveal_speed_ms_per_char: 40,
            grace_delay_ms: 100,
            max_visible_chars: 8000,
            stream_wait_timeout_ms: 30_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_recording_ms: 120_000,
            final_result_grace_ms: 3000,
            init_attempts: 3,
            secret_retry: RetryConfig::default(),
            transcription_url: "https://api.openai.com/v1".to_string(),
            transcription_model: "whisper-1".to_string(),
            language: "en-US".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
        }
    }
}

impl Default for BlinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_interval_ms: 2000,
            max_interval_ms: 6000,
            duration_ms: 300,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let backoff = if self.initial_delay_ms == 0 {
            Backoff::None
        } else {
            Backoff::Exponential {
                initial: Duration::from_millis(self.initial_delay_ms),
                max: Duration::from_millis(self.max_delay_ms),
            }
        };
        RetryPolicy::new(self.max_attempts, backoff)
    }

    fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("Retry attempts must be at least 1".to_string());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("Initial retry delay cannot exceed max delay".to_string());
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn max_recording(&self) -> Duration {
        Duration::from_millis(self.max_recording_ms)
    }

    pub fn final_result_grace(&self) -> Duration {
        Duration::from_millis(self.final_result_grace_ms)
    }

    /// Recognizer construction retries immediately.
    pub fn init_policy(&self) -> RetryPolicy {
        RetryPolicy::immediate(self.init_attempts)
    }
}

impl CaptionConfig {
    pub fn reveal_speed(&self) -> Duration {
        Duration::from_millis(self.reveal_speed_ms_per_char)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    pub fn stream_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_wait_timeout_ms)
    }
}

impl AvatarConfig {
    /// Load from defaults, then an optional TOML file, then `AVATAR__*` env vars.
    /// File path: env `AVATAR_CONFIG` or `config/avatar` (extension optional).
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("AVATAR_CONFIG").unwrap_or_else(|_| "config/avatar".to_string());
        // Every struct is `#[serde(default)]`, so absent keys keep their defaults.
        let builder = config::Config::builder();

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder.add_source(config::File::with_name(&config_path).required(false))
        };

        let loaded: AvatarConfig = builder
            .add_source(config::Environment::with_prefix("AVATAR").separator("__"))
            .build()?
            .try_deserialize()?;

        loaded.validate().map_err(VoiceError::Config)?;
        Ok(loaded)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn preload_timeout(&self) -> Duration {
        Duration::from_millis(self.preload_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err("Server URL must use http or https".to_string());
        }
        if self.avatar.is_empty() || self.avatar.contains("..") || self.avatar.contains('/') {
            return Err("Avatar name must be a single path segment".to_string());
        }
        if self.preload_timeout_ms == 0 {
            return Err("Preload timeout must be greater than 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("Request timeout must be greater than 0".to_string());
        }
        if self.caption.max_visible_chars == 0 {
            return Err("Caption max visible chars must be greater than 0".to_string());
        }
        if self.caption.stream_wait_timeout_ms == 0 {
            return Err("Caption stream wait timeout must be greater than 0".to_string());
        }
        if self.capture.max_recording_ms == 0 {
            return Err("Max recording time must be greater than 0".to_string());
        }
        if self.capture.init_attempts == 0 {
            return Err("Recognizer init attempts must be at least 1".to_string());
        }
        self.capture.secret_retry.validate()?;
        if self.blink.min_interval_ms > self.blink.max_interval_ms {
            return Err("Blink min interval cannot exceed max interval".to_string());
        }
        Ok(())
    }
}
