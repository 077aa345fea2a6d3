//! HTTP implementations of the session server endpoints.
//!
//! | Endpoint | Method | Used by |
//! |----------|--------|---------|
//! | `/api/speech/synthesize` | POST `{text}` | [`HttpSynthesisClient`] |
//! | `/secrets/{key}` | GET | [`HttpSecretSource`] |
//! | `/static/assets/images/{avatar}/{name}?t=` | GET | [`HttpAssetSource`] |
//! | `/candidate/record_usage` | POST `{recording_seconds}` | [`HttpUsageReporter`] |

use crate::capture::UsageReporter;
use crate::config::AvatarConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::orchestrator::{SynthesisClient, SynthesisPayload};
use crate::preload::AssetSource;
use crate::secrets::SecretSource;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

/// Shared client and base URL for one session server.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    client: reqwest::Client,
    base: Url,
}

impl HttpEndpoint {
    pub fn new(server_url: &str, timeout: std::time::Duration) -> VoiceResult<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| VoiceError::Config(format!("invalid server URL {}: {}", server_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(VoiceError::Config(format!("server URL {} cannot be a base", server_url)));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn from_config(config: &AvatarConfig) -> VoiceResult<Self> {
        Self::new(&config.server_url, config.request_timeout())
    }

    /// Base URL with `segments` appended, each percent-encoded.
    pub fn url(&self, segments: &[&str]) -> VoiceResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| VoiceError::Config("server URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn ensure_success(res: reqwest::Response, what: &str) -> VoiceResult<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(VoiceError::Network(format!("{} failed with HTTP {}: {}", what, status, body)))
}

#[derive(Debug, Clone)]
pub struct HttpSynthesisClient {
    endpoint: HttpEndpoint,
}

impl HttpSynthesisClient {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn synthesize(&self, text: &str) -> VoiceResult<SynthesisPayload> {
        let url = self.endpoint.url(&["api", "speech", "synthesize"])?;
        let res = self
            .endpoint
            .client
            .post(url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        let body = ensure_success(res, "speech synthesis").await?.bytes().await?;
        serde_json::from_slice(&body)
            .map_err(|e| VoiceError::Decode(format!("malformed synthesis payload: {}", e)))
    }
}

#[derive(Debug, Clone)]
pub struct HttpSecretSource {
    endpoint: HttpEndpoint,
}

impl HttpSecretSource {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[derive(Deserialize)]
struct SecretBody {
    #[serde(default)]
    value: Option<String>,
}

#[async_trait]
impl SecretSource for HttpSecretSource {
    async fn fetch(&self, key: &str) -> VoiceResult<String> {
        let url = self.endpoint.url(&["secrets", key])?;
        let res = self.endpoint.client.get(url).send().await?;
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(VoiceError::RateLimited(key.to_string()));
        }
        let body: SecretBody = ensure_success(res, "secret retrieval")
            .await?
            .json()
            .await
            .map_err(|_| VoiceError::Network("invalid response format".to_string()))?;
        match body.value {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(VoiceError::Network("invalid response format".to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpAssetSource {
    endpoint: HttpEndpoint,
    avatar: String,
}

impl HttpAssetSource {
    pub fn new(endpoint: HttpEndpoint, avatar: impl Into<String>) -> Self {
        Self {
            endpoint,
            avatar: avatar.into(),
        }
    }

    pub fn asset_url(&self, name: &str, cache_bust: &str) -> VoiceResult<Url> {
        let mut url = self
            .endpoint
            .url(&["static", "assets", "images", &self.avatar, name])?;
        url.query_pairs_mut().append_pair("t", cache_bust);
        Ok(url)
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn load(&self, name: &str, cache_bust: &str) -> VoiceResult<Bytes> {
        let url = self.asset_url(name, cache_bust)?;
        debug!("http: GET {}", url);
        let res = self.endpoint.client.get(url).send().await?;
        Ok(ensure_success(res, name).await?.bytes().await?)
    }
}

#[derive(Debug, Clone)]
pub struct HttpUsageReporter {
    endpoint: HttpEndpoint,
}

impl HttpUsageReporter {
    pub fn new(endpoint: HttpEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl UsageReporter for HttpUsageReporter {
    async fn report(&self, recording_seconds: u64) -> VoiceResult<()> {
        let url = self.endpoint.url(&["candidate", "record_usage"])?;
        let res = self
            .endpoint
            .client
            .post(url)
            .json(&serde_json::json!({ "recording_seconds": recording_seconds }))
            .send()
            .await?;
        ensure_success(res, "usage report").await?;
        Ok(())
    }
}
