//! Encode path: software JPEG compression or a hardware encoder surface
//!
//! Exactly one mode is active at a time. The path moves through
//! `Idle -> Configured -> Running -> Draining -> Idle`; a hardware encoder
//! that cannot be created or started is replaced by software compression.

pub mod convert;
pub mod hardware;
pub mod jpeg;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::{CaptureProvider, CaptureSink, HardwareEncoder, Size};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::pipeline::FrameQueue;
use crate::state::SharedState;

pub use hardware::{DrainContext, EncoderCommand, HardwareSession};
pub use jpeg::{clamp_quality, compress_jpeg, SoftwareCompressor};

/// Floor for the derived bitrate.
pub const MIN_BITRATE: u32 = 800_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecMode {
    /// Per-frame JPEG compression in software
    #[default]
    Software,
    /// Camera renders into a hardware video encoder
    Hardware,
}

impl fmt::Display for CodecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Software => f.write_str("mjpeg"),
            Self::Hardware => f.write_str("h264"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub jpeg_quality: u8,
    /// Bits per second; `None` derives it from size and fps.
    pub bitrate: Option<u32>,
    pub codec_mode: CodecMode,
    pub key_frame_interval_secs: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            target_fps: 30,
            jpeg_quality: 85,
            bitrate: None,
            codec_mode: CodecMode::Software,
            key_frame_interval_secs: 1,
        }
    }
}

/// `width * height * fps / 6`, never below [`MIN_BITRATE`].
pub fn default_bitrate(width: u32, height: u32, fps: u32) -> u32 {
    let derived = u64::from(width) * u64::from(height) * u64::from(fps.max(1)) / 6;
    derived.clamp(u64::from(MIN_BITRATE), u64::from(u32::MAX)) as u32
}

impl EncoderConfig {
    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn with_size(mut self, size: Size) -> Self {
        self.width = size.width;
        self.height = size.height;
        self
    }

    pub fn effective_bitrate(&self) -> u32 {
        self.bitrate
            .unwrap_or_else(|| default_bitrate(self.width, self.height, self.target_fps))
    }

    /// Whether switching to `other` needs a new encoder rather than a
    /// parameter update.
    pub fn needs_rebuild(&self, other: &EncoderConfig) -> bool {
        self.codec_mode != other.codec_mode || self.size() != other.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Idle,
    Configured,
    Running,
    Draining,
}

enum Engine {
    Software(Arc<SoftwareCompressor>),
    PendingHardware(Box<dyn HardwareEncoder>),
    Hardware(HardwareSession),
}

pub struct EncodePath {
    provider: Arc<dyn CaptureProvider>,
    ctx: DrainContext,
    state: EncodeState,
    /// What the caller asked for
    requested: Option<EncoderConfig>,
    /// What is actually running (mode differs after a fallback)
    active: Option<EncoderConfig>,
    engine: Option<Engine>,
}

impl EncodePath {
    pub fn new(
        provider: Arc<dyn CaptureProvider>,
        queue: Arc<FrameQueue>,
        shared: Arc<SharedState>,
        events: EventBus,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            ctx: DrainContext {
                queue,
                shared,
                events,
                poll_timeout: drain_timeout,
            },
            state: EncodeState::Idle,
            requested: None,
            active: None,
            engine: None,
        }
    }

    pub fn state(&self) -> EncodeState {
        self.state
    }

    /// Effective configuration of the running encoder.
    pub fn config(&self) -> Option<&EncoderConfig> {
        self.active.as_ref()
    }

    pub fn mode(&self) -> Option<CodecMode> {
        self.active.as_ref().map(|c| c.codec_mode)
    }

    /// `Idle -> Configured`. A hardware encoder that cannot be created is
    /// replaced by software compression.
    #[instrument(skip(self), fields(mode = ?config.codec_mode, size = %config.size()))]
    pub fn configure(&mut self, config: EncoderConfig) -> Result<()> {
        if self.state != EncodeState::Idle {
            self.stop();
        }
        // Units of the previous size or mode must not reach clients
        self.ctx.queue.clear();
        self.ctx.shared.clear_codec_config();

        let mut active = config.clone();
        let engine = match config.codec_mode {
            CodecMode::Software => self.software_engine(&config),
            CodecMode::Hardware => match self.provider.create_encoder(&config) {
                Ok(encoder) => Engine::PendingHardware(encoder),
                Err(e) => {
                    self.report_fallback(&e);
                    active.codec_mode = CodecMode::Software;
                    self.software_engine(&config)
                }
            },
        };

        self.engine = Some(engine);
        self.requested = Some(config);
        self.active = Some(active);
        self.state = EncodeState::Configured;
        Ok(())
    }

    /// `Configured -> Running`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            EncodeState::Running => return Ok(()),
            EncodeState::Configured => {}
            other => {
                return Err(StreamError::EncoderInit(format!(
                    "cannot start encode path from {other:?}"
                )))
            }
        }

        let engine = match self.engine.take() {
            Some(Engine::PendingHardware(encoder)) => {
                match HardwareSession::start(encoder, self.ctx.clone()) {
                    Ok(session) => Engine::Hardware(session),
                    Err(e) => {
                        self.report_fallback(&e);
                        let config = self.active.clone().unwrap_or_default();
                        if let Some(active) = self.active.as_mut() {
                            active.codec_mode = CodecMode::Software;
                        }
                        self.software_engine(&config)
                    }
                }
            }
            Some(engine) => engine,
            None => {
                return Err(StreamError::EncoderInit(
                    "encode path has no engine".into(),
                ))
            }
        };

        self.engine = Some(engine);
        self.state = EncodeState::Running;
        info!("Encode path running in {:?} mode", self.mode());
        Ok(())
    }

    /// Where the camera should deliver pixels for the active mode.
    pub fn sink(&self) -> Result<CaptureSink> {
        match &self.engine {
            Some(Engine::Software(compressor)) => {
                let compressor = Arc::clone(compressor);
                Ok(CaptureSink::PushFrame(Arc::new(move |image| {
                    compressor.process(image)
                })))
            }
            Some(Engine::Hardware(session)) => Ok(CaptureSink::SurfaceSink(session.surface())),
            _ => Err(StreamError::EncoderInit(format!(
                "encode path is {:?}, no sink available",
                self.state
            ))),
        }
    }

    /// Apply `config` to the running encoder without rebuilding it. Returns
    /// false when mode or size changed, or the encoder cannot take the new
    /// rates live; the caller then has to [`rebuild`](Self::rebuild).
    pub fn try_update(&mut self, config: &EncoderConfig) -> Result<bool> {
        let reusable = self.state == EncodeState::Running
            && self
                .requested
                .as_ref()
                .is_some_and(|current| !current.needs_rebuild(config));
        Ok(reusable && self.update_rates(config)?)
    }

    /// Tear the encoder down and build it again for `config`. Whatever renders
    /// into the previous sink must already be closed.
    pub fn rebuild(&mut self, config: EncoderConfig) -> Result<()> {
        self.configure(config)?;
        self.start()
    }

    /// Apply quality, bitrate and fps in place. Returns false when the
    /// running encoder cannot take the change live.
    fn update_rates(&mut self, config: &EncoderConfig) -> Result<bool> {
        let Some(active) = self.active.clone() else {
            return Ok(false);
        };

        match &self.engine {
            Some(Engine::Software(compressor)) => {
                compressor.set_quality(config.jpeg_quality);
            }
            Some(Engine::Hardware(session)) => {
                let next = config.effective_bitrate();
                if next != active.effective_bitrate() {
                    if !session.supports_live_bitrate() {
                        debug!("Encoder cannot change bitrate live, rebuilding");
                        return Ok(false);
                    }
                    session.send(EncoderCommand::SetBitrate(next))?;
                }
            }
            _ => return Ok(false),
        }

        let mut updated = config.clone();
        updated.codec_mode = active.codec_mode;
        self.active = Some(updated);
        self.requested = Some(config.clone());
        Ok(true)
    }

    /// Replace whatever runs with software compression at the same size.
    pub fn fallback_to_software(&mut self) -> Result<()> {
        let mut config = self
            .requested
            .clone()
            .or_else(|| self.active.clone())
            .unwrap_or_default();
        config.codec_mode = CodecMode::Software;
        self.rebuild(config)
    }

    /// `Running -> Draining -> Idle`. Joins the drain thread if any.
    pub fn stop(&mut self) {
        if self.state == EncodeState::Idle {
            return;
        }
        self.state = EncodeState::Draining;
        if let Some(Engine::Hardware(mut session)) = self.engine.take() {
            session.stop();
        }
        self.engine = None;
        self.active = None;
        self.requested = None;
        self.ctx.shared.clear_codec_config();
        self.state = EncodeState::Idle;
        debug!("Encode path idle");
    }

    fn software_engine(&self, config: &EncoderConfig) -> Engine {
        Engine::Software(Arc::new(SoftwareCompressor::new(
            config.jpeg_quality,
            Arc::clone(&self.ctx.queue),
            Arc::clone(&self.ctx.shared),
        )))
    }

    fn report_fallback(&self, error: &StreamError) {
        warn!("Hardware encoder unavailable, falling back to software: {}", error);
        self.ctx.events.emit(StreamEvent::EncoderFallback {
            reason: error.to_string(),
        });
    }
}

impl Drop for EncodePath {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Frame;
    use crate::capture::virtual_cam::{EncoderFault, VirtualProvider};

    fn path(provider: VirtualProvider) -> (EncodePath, flume::Receiver<StreamEvent>) {
        let events = EventBus::new();
        let rx = events.subscribe();
        let path = EncodePath::new(
            Arc::new(provider),
            Arc::new(FrameQueue::new(1)),
            Arc::new(SharedState::new()),
            events,
            Duration::from_millis(10),
        );
        (path, rx)
    }

    fn hardware_config() -> EncoderConfig {
        EncoderConfig {
            width: 640,
            height: 480,
            codec_mode: CodecMode::Hardware,
            ..Default::default()
        }
    }

    #[test]
    fn default_bitrate_has_a_floor() {
        assert_eq!(default_bitrate(1280, 720, 30), 4_608_000);
        assert_eq!(default_bitrate(160, 120, 15), MIN_BITRATE);
        let config = EncoderConfig {
            bitrate: Some(2_500_000),
            ..Default::default()
        };
        assert_eq!(config.effective_bitrate(), 2_500_000);
    }

    #[test]
    fn walks_the_state_machine() {
        let (mut path, _events) = path(VirtualProvider::new());
        assert_eq!(path.state(), EncodeState::Idle);
        assert!(path.sink().is_err());

        path.configure(hardware_config()).unwrap();
        assert_eq!(path.state(), EncodeState::Configured);

        path.start().unwrap();
        assert_eq!(path.state(), EncodeState::Running);
        assert_eq!(path.mode(), Some(CodecMode::Hardware));
        assert!(matches!(path.sink().unwrap(), CaptureSink::SurfaceSink(_)));

        path.stop();
        assert_eq!(path.state(), EncodeState::Idle);
        assert_eq!(path.mode(), None);
    }

    #[test]
    fn missing_encoder_falls_back_to_software() {
        let (mut path, events) = path(VirtualProvider::new().without_hardware_encoder());
        path.configure(hardware_config()).unwrap();
        path.start().unwrap();

        assert_eq!(path.mode(), Some(CodecMode::Software));
        assert!(matches!(path.sink().unwrap(), CaptureSink::PushFrame(_)));
        assert!(matches!(
            events.try_recv(),
            Ok(StreamEvent::EncoderFallback { .. })
        ));
    }

    #[test]
    fn failed_start_falls_back_to_software() {
        let provider = VirtualProvider::new().with_encoder_fault(EncoderFault::Start);
        let (mut path, _events) = path(provider);
        path.configure(hardware_config()).unwrap();
        assert_eq!(path.mode(), Some(CodecMode::Hardware));

        path.start().unwrap();
        assert_eq!(path.state(), EncodeState::Running);
        assert_eq!(path.mode(), Some(CodecMode::Software));
    }

    #[test]
    fn rate_changes_update_in_place_and_resizes_rebuild() {
        let provider = VirtualProvider::new();
        let stats = provider.stats();
        let (mut path, _events) = path(provider);

        assert!(!path.try_update(&hardware_config()).unwrap());
        path.rebuild(hardware_config()).unwrap();

        let faster = EncoderConfig {
            target_fps: 60,
            ..hardware_config()
        };
        assert!(path.try_update(&faster).unwrap());
        assert_eq!(stats.encoder_count(), 1);
        assert_eq!(path.config().unwrap().target_fps, 60);

        let bigger = hardware_config().with_size(Size::new(1280, 720));
        assert!(!path.try_update(&bigger).unwrap());
        assert_eq!(path.config().unwrap().size(), Size::new(640, 480));
        path.rebuild(bigger).unwrap();
        assert_eq!(stats.encoder_count(), 2);
    }

    #[test]
    fn rebuild_drops_frames_of_the_previous_encoder() {
        let queue = Arc::new(FrameQueue::new(2));
        let mut path = EncodePath::new(
            Arc::new(VirtualProvider::new()),
            Arc::clone(&queue),
            Arc::new(SharedState::new()),
            EventBus::new(),
            Duration::from_millis(10),
        );
        path.rebuild(EncoderConfig::default()).unwrap();
        queue.offer(Frame::image(bytes::Bytes::from_static(b"old"), 1));

        path.rebuild(hardware_config()).unwrap();
        assert!(queue.poll(Duration::ZERO).is_none());
    }

    #[test]
    fn fallback_keeps_requested_size() {
        let (mut path, _events) = path(VirtualProvider::new());
        path.rebuild(hardware_config()).unwrap();
        path.fallback_to_software().unwrap();

        let config = path.config().unwrap();
        assert_eq!(config.codec_mode, CodecMode::Software);
        assert_eq!(config.size(), Size::new(640, 480));
    }
}
