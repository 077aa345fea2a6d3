//! Secret retrieval with a retry policy. Rate limiting is terminal.

use crate::error::{VoiceError, VoiceResult};
use crate::recognizer::SpeechCredentials;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

/// Recognizer subscription key.
pub const SPEECH_KEY: &str = "KEY1-SPEECH";
/// Recognizer service region.
pub const SPEECH_REGION: &str = "SPEECH-LOCATION";

/// One attempt at fetching a named secret.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Fetch `key`. Return [`VoiceError::RateLimited`] when the server refuses further attempts.
    async fn fetch(&self, key: &str) -> VoiceResult<String>;
}

pub struct SecretRetriever {
    source: Arc<dyn SecretSource>,
    policy: RetryPolicy,
}

impl SecretRetriever {
    pub fn new(source: Arc<dyn SecretSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetch `key`, retrying per policy. Both `RateLimited` and `RetriesExhausted` are fatal.
    pub async fn get(&self, key: &str) -> VoiceResult<String> {
        if key.trim().is_empty() {
            return Err(VoiceError::InvalidInput("secret key is empty".to_string()));
        }
        let label = format!("secret {}", key);
        let result = self
            .policy
            .run(&label, |_attempt| async move {
                let value = self.source.fetch(key).await?;
                if value.is_empty() {
                    return Err(VoiceError::Network("invalid response format".to_string()));
                }
                Ok(value)
            })
            .await;
        if let Err(e) = &result {
            error!("❌ secrets: giving up on {}: {}", key, e);
        }
        result
    }

    /// Region first, then key.
    pub async fn speech_credentials(&self) -> VoiceResult<SpeechCredentials> {
        let region = self.get(SPEECH_REGION).await?;
        let key = self.get(SPEECH_KEY).await?;
        info!("secrets: speech credentials retrieved (region {})", region);
        Ok(SpeechCredentials { key, region })
    }
}
