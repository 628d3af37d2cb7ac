//! Seams towards the camera hardware
//!
//! A [`CaptureProvider`] enumerates cameras, opens devices against a
//! [`CaptureSink`] and, when the platform has one, hands out a
//! [`HardwareEncoder`] whose input surface the camera writes into directly.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::capture::{PlanarImage, Size};
use crate::encode::EncoderConfig;
use crate::error::{Result, StreamError};

/// Which camera to use: by facing, or by provider-specific identifier.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CameraSelector {
    #[default]
    Back,
    Front,
    Id(String),
}

impl From<&str> for CameraSelector {
    fn from(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("back") {
            Self::Back
        } else if trimmed.eq_ignore_ascii_case("front") {
            Self::Front
        } else {
            Self::Id(trimmed.to_string())
        }
    }
}

impl From<String> for CameraSelector {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<CameraSelector> for String {
    fn from(value: CameraSelector) -> Self {
        value.to_string()
    }
}

impl FromStr for CameraSelector {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for CameraSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Back => f.write_str("back"),
            Self::Front => f.write_str("front"),
            Self::Id(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Back,
    Front,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: String,
    pub display_name: String,
    pub facing: Facing,
}

impl CameraInfo {
    pub fn new(id: impl Into<String>, facing: Facing) -> Self {
        let id = id.into();
        let label = match facing {
            Facing::Back => "back",
            Facing::Front => "front",
            Facing::External => "external",
        };
        Self {
            display_name: format!("{label} ({id})"),
            id,
            facing,
        }
    }
}

/// Per-device tuning the operator may change while streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraControls {
    pub torch: bool,
    pub auto_focus: bool,
    /// Manual focus position, 0 (infinity) to 100 (closest)
    pub focus: u8,
    pub auto_exposure: bool,
    pub exposure_compensation: i32,
}

impl Default for CameraControls {
    fn default() -> Self {
        Self {
            torch: false,
            auto_focus: true,
            focus: 0,
            auto_exposure: true,
            exposure_compensation: 0,
        }
    }
}

impl CameraControls {
    pub fn normalized(mut self) -> Self {
        self.focus = self.focus.min(100);
        self
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Repeating capture request issued when a device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub size: Size,
    pub fps: u32,
}

/// Callback invoked on the provider's capture thread for every image.
pub type ImageCallback = Arc<dyn Fn(PlanarImage) + Send + Sync>;

/// Where a device delivers its pixels.
#[derive(Clone)]
pub enum CaptureSink {
    /// Decoded pixel buffers, pushed to the software compressor
    PushFrame(ImageCallback),
    /// Writable input of a hardware encoder
    SurfaceSink(Arc<dyn EncoderSurface>),
}

impl fmt::Debug for CaptureSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PushFrame(_) => f.write_str("PushFrame"),
            Self::SurfaceSink(_) => f.write_str("SurfaceSink"),
        }
    }
}

/// Encoder-owned input the camera renders into.
pub trait EncoderSurface: Send + Sync {
    fn write_image(&self, image: PlanarImage) -> Result<()>;
}

/// An open camera with a running repeating request.
pub trait CaptureDevice: Send {
    fn camera_id(&self) -> &str;

    /// Change the repeating request's frame rate without reopening.
    fn set_frame_rate(&mut self, _fps: u32) -> Result<()> {
        Err(StreamError::Unsupported("live frame rate change".into()))
    }

    fn apply_controls(&mut self, _controls: &CameraControls) -> Result<()> {
        Err(StreamError::Unsupported("camera controls".into()))
    }

    /// Stop the repeating request and release the device. Blocks until the
    /// capture thread no longer touches the sink.
    fn close(&mut self);
}

/// What one bounded poll of the encoder output produced.
#[derive(Debug, Clone)]
pub enum EncoderOutput {
    /// Codec parameter sets, needed before any access unit decodes
    Config(Bytes),
    AccessUnit {
        data: Bytes,
        key_frame: bool,
        captured_at: Option<Instant>,
    },
    /// Output format renegotiated; nothing to forward
    FormatChanged,
    /// Nothing ready within the timeout
    TryAgain,
}

pub trait HardwareEncoder: Send {
    fn input_surface(&self) -> Arc<dyn EncoderSurface>;

    fn start(&mut self) -> Result<()>;

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput>;

    /// Whether `set_bitrate` takes effect without re-initialization.
    fn supports_live_bitrate(&self) -> bool {
        false
    }

    fn set_bitrate(&mut self, _bits_per_second: u32) -> Result<()> {
        Err(StreamError::Unsupported("live bitrate change".into()))
    }

    fn request_key_frame(&mut self) {}

    fn stop(&mut self);
}

pub trait CaptureProvider: Send + Sync {
    fn cameras(&self) -> Result<Vec<CameraInfo>>;

    fn supported_sizes(&self, camera_id: &str) -> Result<Vec<Size>>;

    fn open(
        &self,
        camera: &CameraInfo,
        request: CaptureRequest,
        sink: CaptureSink,
    ) -> Result<Box<dyn CaptureDevice>>;

    fn create_encoder(&self, _config: &EncoderConfig) -> Result<Box<dyn HardwareEncoder>> {
        Err(StreamError::EncoderInit(
            "no hardware encoder on this provider".into(),
        ))
    }

    /// Map a selector onto a concrete camera.
    fn resolve(&self, selector: &CameraSelector) -> Result<CameraInfo> {
        let cameras = self.cameras()?;
        let found = match selector {
            CameraSelector::Back => cameras.into_iter().find(|c| c.facing == Facing::Back),
            CameraSelector::Front => cameras.into_iter().find(|c| c.facing == Facing::Front),
            CameraSelector::Id(id) => cameras.into_iter().find(|c| &c.id == id),
        };
        found.ok_or_else(|| StreamError::CameraNotFound(selector.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_parsing_is_case_insensitive() {
        assert_eq!(CameraSelector::from("BACK"), CameraSelector::Back);
        assert_eq!(CameraSelector::from(" front "), CameraSelector::Front);
        assert_eq!(
            CameraSelector::from("/dev/video2"),
            CameraSelector::Id("/dev/video2".into())
        );
        assert_eq!(CameraSelector::Front.to_string(), "front");
    }

    #[test]
    fn controls_clamp_focus() {
        let controls = CameraControls {
            focus: 250,
            ..Default::default()
        }
        .normalized();
        assert_eq!(controls.focus, 100);
    }
}
