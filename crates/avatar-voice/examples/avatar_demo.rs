//! Example: speak one line on the avatar against a running session server
//!
//! ```text
//! RUST_LOG=avatar_voice=debug AVATAR__SERVER_URL=http://127.0.0.1:5000 cargo run --example avatar_demo -- "Tell me about yourself."
//! ```
//!
//! Without the `native-audio` feature the clip is "played" against the clock and the
//! avatar surface just logs what it would draw.

use avatar_voice::{
    AssetPreloader, AudioBackend, AvatarConfig, AvatarOrchestrator, AvatarSurface, CaptionRevealController,
    CaptionSurface, HttpAssetSource, HttpEndpoint, HttpSynthesisClient, PreloadedAsset,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

struct LogSurface;

impl AvatarSurface for LogSurface {
    fn show_mouth(&self, asset: &PreloadedAsset) {
        info!("👄 mouth -> {}", asset.name());
    }

    fn reset_neutral(&self) {
        info!("👄 mouth -> neutral");
    }

    fn show_layer(&self, asset: &PreloadedAsset) {
        info!("🖼️ layer {}", asset.name());
    }

    fn start_head_motion(&self, period: Duration) {
        info!("head motion ({:?} period)", period);
    }
}

struct LogCaption;

impl CaptionSurface for LogCaption {
    fn render(&self, markup: &str) {
        info!("💬 {}", markup);
    }

    fn set_controls_enabled(&self, enabled: bool) {
        info!("controls {}", if enabled { "enabled" } else { "disabled" });
    }
}

fn audio_backend() -> Result<Arc<dyn AudioBackend>, Box<dyn std::error::Error>> {
    #[cfg(feature = "native-audio")]
    {
        Ok(Arc::new(avatar_voice::RodioBackend::new()?))
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Ok(Arc::new(avatar_voice::ClockedBackend::new()))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let text = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Hello! Let's begin the interview.".to_string());

    info!("🎭 Avatar Demo");
    info!("==============");

    let config = AvatarConfig::load()?;
    let endpoint = HttpEndpoint::from_config(&config)?;
    let preloader = Arc::new(AssetPreloader::new(Arc::new(HttpAssetSource::new(
        endpoint.clone(),
        config.avatar.clone(),
    ))));
    let avatar = Arc::new(AvatarOrchestrator::new(
        config.clone(),
        Arc::new(HttpSynthesisClient::new(endpoint)),
        preloader,
        Arc::new(LogSurface),
        audio_backend()?,
    ));
    let captions =
        CaptionRevealController::new(config.caption.clone(), Arc::new(LogCaption), avatar.view());

    let report = avatar.prepare().await;
    if !report.failed.is_empty() {
        warn!("missing assets: {:?}", report.failed);
    }

    let speaking = {
        let avatar = Arc::clone(&avatar);
        let text = text.clone();
        tokio::spawn(async move { avatar.stream_avatar(&text).await })
    };

    tokio::select! {
        revealed = captions.reveal(&text) => {
            if let Err(e) = revealed {
                warn!("caption: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Interrupted");
            captions.stop();
            avatar.stop_avatar_stream(true);
        }
    }

    match speaking.await? {
        Ok(outcome) => info!("✅ Run finished: {:?}", outcome),
        Err(e) => warn!("Run failed: {}", e),
    }
    avatar.shutdown();
    Ok(())
}
