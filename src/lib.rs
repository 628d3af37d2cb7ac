pub mod capture;
pub mod controller;
pub mod encode;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod server;
pub mod state;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{CameraControls, CameraInfo, CameraSelector, Frame, FrameKind, PlanarImage, Size};
pub use controller::{
    ControlOutcome, ReconfigureRequest, SessionController, StartRequest, StreamStatus,
};
pub use encode::{CodecMode, EncoderConfig};
pub use error::{Result, StreamError};
pub use events::{EventBus, StreamEvent};
pub use pipeline::FrameQueue;

/// Prefix for environment overrides, e.g. `LENSCAST_SERVER__PORT=5000`.
pub const ENV_PREFIX: &str = "LENSCAST";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub encoder: EncoderSettings,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// A peer that sends no request within this window is dropped.
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Upper bound on a single `FrameQueue` wait inside a client loop.
    pub poll_timeout_ms: u64,
    /// Sleep between non-blocking accept attempts.
    pub accept_poll_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Synthetic test-pattern camera with a virtual encoder
    Virtual,
    /// Video4Linux2 devices (requires the `v4l2` feature)
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub provider: ProviderKind,
    /// `back`, `front`, or a device identifier
    pub camera: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// V4L2 device reported as the back-facing camera
    pub back_device: Option<String>,
    /// V4L2 device reported as the front-facing camera
    pub front_device: Option<String>,
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub codec_mode: CodecMode,
    pub jpeg_quality: u8,
    /// Bits per second; derived from resolution and fps when unset.
    pub bitrate: Option<u32>,
    pub key_frame_interval_secs: u32,
    /// Bounded wait for one encoder output poll.
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Retained frames, clamped to 1..=2.
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            capture: CaptureConfig::default(),
            encoder: EncoderSettings::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 4747,
            read_timeout_ms: 5000,
            write_timeout_ms: 5000,
            poll_timeout_ms: 1000,
            accept_poll_ms: 50,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Virtual,
            camera: "back".into(),
            width: 1280,
            height: 720,
            fps: 30,
            back_device: None,
            front_device: None,
            buffer_count: 4,
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec_mode: CodecMode::Software,
            jpeg_quality: 85,
            bitrate: None,
            key_frame_interval_secs: 1,
            drain_timeout_ms: 20,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_capacity: 1 }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `LENSCAST_*` environment
    /// variables into one configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    pub fn start_request(&self) -> StartRequest {
        StartRequest {
            host: self.server.host.clone(),
            port: self.server.port,
            camera: CameraSelector::from(self.capture.camera.as_str()),
            size: Size::new(self.capture.width, self.capture.height),
            fps: self.capture.fps,
            jpeg_quality: self.encoder.jpeg_quality,
            bitrate: self.encoder.bitrate,
            codec_mode: self.encoder.codec_mode,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms.max(1))
    }
}
