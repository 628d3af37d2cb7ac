//! lenscast: serve a camera as a live TCP video stream

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use lenscast::capture::{CaptureProvider, VirtualProvider};
use lenscast::{Config, ProviderKind, SessionController, StreamEvent};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "lenscast.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lenscast=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("lenscast launching...");

    // Load configuration
    let path = std::env::var_os("LENSCAST_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Config::load(Some(&path))?;

    let provider = build_provider(&config)?;
    for camera in provider.cameras()? {
        info!("Camera available: {} [{}]", camera.display_name, camera.id);
    }

    let mut controller = SessionController::new(provider, &config);
    let events = controller.subscribe();
    controller.start(config.start_request())?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Signal handler failed: {}", e);
                }
                break;
            }
            event = events.recv_async() => {
                let Ok(event) = event else { break };
                match event {
                    StreamEvent::EncoderFailed { reason } => {
                        warn!("Hardware encoder failed ({}), falling back to software", reason);
                        if let Err(e) = controller.fallback_to_software() {
                            error!("Fallback failed: {}", e);
                        }
                    }
                    StreamEvent::Stopped => {
                        info!("Session stopped");
                        break;
                    }
                    other => info!("{:?}", other),
                }
            }
        }
    }

    controller.stop();
    info!("lenscast shutting down");
    Ok(())
}

fn build_provider(config: &Config) -> Result<Arc<dyn CaptureProvider>> {
    match config.capture.provider {
        ProviderKind::Virtual => Ok(Arc::new(VirtualProvider::new())),
        #[cfg(feature = "v4l2")]
        ProviderKind::V4l2 => Ok(Arc::new(lenscast::capture::V4l2Provider::new(
            config.capture.clone(),
        ))),
        #[cfg(not(feature = "v4l2"))]
        ProviderKind::V4l2 => Err(color_eyre::eyre::eyre!(
            "v4l2 provider requested, but built without the `v4l2` feature"
        )),
    }
}
