pub mod frame;
pub mod provider;
pub mod resolution;
pub mod session;
pub mod virtual_cam;

#[cfg(feature = "v4l2")]
pub mod v4l2;

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_encoder;

pub use frame::{chroma_len, Frame, FrameKind, PixelFormat, PlanarImage, Plane};
pub use provider::{
    CameraControls, CameraInfo, CameraSelector, CaptureDevice, CaptureProvider, CaptureRequest,
    CaptureSink, EncoderOutput, EncoderSurface, Facing, HardwareEncoder, ImageCallback,
};
pub use resolution::{nearest_supported, Size};
pub use session::CaptureSession;
pub use virtual_cam::VirtualProvider;

#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Provider;
