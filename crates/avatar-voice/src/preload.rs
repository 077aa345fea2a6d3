//! Parallel, failure-tolerant preloading of the avatar's visual assets.
//!
//! Every asset load runs concurrently with a shared cache-busting token. Failures are
//! logged and skipped; the preload always settles with a count of what actually loaded.
//! Readiness is published on a watch channel so the orchestrator can wait without polling.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Neutral (closed) mouth shape.
pub const NEUTRAL_MOUTH: &str = "0.png";

/// Highest viseme id with its own mouth image.
pub const MAX_VISEME_ID: u32 = 21;

/// Full asset set for one avatar: backdrop, eyes overlay, 22 mouth shapes and the head.
pub fn default_avatar_assets() -> Vec<String> {
    let mut names = vec!["background.png".to_string(), "eyes-closed.png".to_string()];
    names.extend((0..=MAX_VISEME_ID).map(|id| format!("{}.png", id)));
    names.push("head.png".to_string());
    names
}

/// Where asset bytes come from (HTTP in production, fixtures in tests).
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Load one named asset. `cache_bust` must be appended so stale copies are not served.
    async fn load(&self, name: &str, cache_bust: &str) -> VoiceResult<Bytes>;
}

/// A cached asset whose backing resource is released exactly once.
#[derive(Debug)]
pub struct PreloadedAsset {
    name: String,
    data: Mutex<Option<Bytes>>,
    revoked: AtomicBool,
}

impl PreloadedAsset {
    pub fn new(name: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(Some(data)),
            revoked: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Asset bytes, or `None` once revoked.
    pub fn data(&self) -> Option<Bytes> {
        self.data.lock().clone()
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Release the backing resource. Returns false if it was already released.
    pub fn revoke(&self) -> bool {
        if self.revoked.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.data.lock().take();
        true
    }
}

/// Readiness of the current asset set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadStatus {
    Idle,
    Loading { generation: u64 },
    Ready { generation: u64, loaded: usize, requested: usize },
}

/// Outcome of one preload run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadReport {
    /// Distinct names requested; duplicates load once.
    pub requested: usize,
    pub loaded: usize,
    pub failed: Vec<String>,
}

/// Name-keyed asset cache fed by parallel loads.
pub struct AssetPreloader {
    source: Arc<dyn AssetSource>,
    cache: DashMap<String, Arc<PreloadedAsset>>,
    generation: AtomicU64,
    status: watch::Sender<PreloadStatus>,
}

impl AssetPreloader {
    pub fn new(source: Arc<dyn AssetSource>) -> Self {
        let (status, _rx) = watch::channel(PreloadStatus::Idle);
        Self {
            source,
            cache: DashMap::new(),
            generation: AtomicU64::new(0),
            status,
        }
    }

    /// Load every named asset in parallel. Clears (and releases) any previous cache first.
    ///
    /// Never fails: a load error is logged and the name is reported in `failed`.
    pub async fn preload(&self, names: &[String]) -> PreloadReport {
        let released = self.clear_cache();
        if released > 0 {
            debug!("preload: released {} assets from the previous run", released);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.send_replace(PreloadStatus::Loading { generation });

        let mut unique: Vec<&String> = Vec::with_capacity(names.len());
        for name in names {
            if !unique.contains(&name) {
                unique.push(name);
            }
        }

        let cache_bust = chrono::Utc::now().timestamp_millis().to_string();
        info!("preload: loading {} assets (t={})", unique.len(), cache_bust);

        let loads = unique.iter().map(|&name| {
            let cache_bust = cache_bust.as_str();
            async move {
                match self.source.load(name, cache_bust).await {
                    Ok(bytes) => {
                        if self.generation.load(Ordering::SeqCst) != generation {
                            debug!("preload: dropping stale asset {}", name);
                            return Err(name.clone());
                        }
                        let asset = Arc::new(PreloadedAsset::new(name.clone(), bytes));
                        if let Some(previous) = self.cache.insert(name.clone(), asset) {
                            previous.revoke();
                        }
                        Ok(())
                    }
                    Err(e) => {
                        warn!("preload: failed to fetch asset {}: {}", name, e);
                        Err(name.clone())
                    }
                }
            }
        });

        let mut loaded = 0;
        let mut failed = Vec::new();
        for result in futures::future::join_all(loads).await {
            match result {
                Ok(()) => loaded += 1,
                Err(name) => failed.push(name),
            }
        }

        let report = PreloadReport {
            requested: unique.len(),
            loaded,
            failed,
        };

        if self.generation.load(Ordering::SeqCst) == generation {
            self.status.send_replace(PreloadStatus::Ready {
                generation,
                loaded: report.loaded,
                requested: report.requested,
            });
        }
        info!(
            "preload: loaded {}/{} assets for avatar",
            report.loaded, report.requested
        );
        report
    }

    pub fn get(&self, name: &str) -> Option<Arc<PreloadedAsset>> {
        self.cache.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn status(&self) -> PreloadStatus {
        *self.status.borrow()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status(), PreloadStatus::Ready { .. })
    }

    pub fn subscribe(&self) -> watch::Receiver<PreloadStatus> {
        self.status.subscribe()
    }

    /// Wait until the current asset set has settled. Returns the loaded count.
    pub async fn wait_ready(&self, limit: Duration) -> VoiceResult<usize> {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(
            limit,
            rx.wait_for(|s| matches!(s, PreloadStatus::Ready { .. })),
        )
        .await;
        match waited {
            Ok(Ok(status)) => match *status {
                PreloadStatus::Ready { loaded, .. } => Ok(loaded),
                _ => Ok(0),
            },
            Ok(Err(_)) => Err(VoiceError::Playback("preloader dropped".to_string())),
            Err(_) => Err(VoiceError::Timeout("avatar assets".to_string())),
        }
    }

    /// Release every cached asset once and empty the cache. Returns how many were released.
    pub fn cleanup(&self) -> usize {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let released = self.clear_cache();
        self.status.send_replace(PreloadStatus::Idle);
        released
    }

    fn clear_cache(&self) -> usize {
        let names: Vec<String> = self.cache.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.cache.remove(&name))
            .filter(|(_, asset)| asset.revoke())
            .count()
    }
}

impl Drop for AssetPreloader {
    fn drop(&mut self) {
        self.clear_cache();
    }
}
