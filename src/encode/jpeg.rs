//! Software compression: one JPEG per captured image

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{trace, warn};

use crate::capture::{Frame, PlanarImage};
use crate::encode::convert::{nv21_to_rgb, planar_to_nv21};
use crate::error::{Result, StreamError};
use crate::pipeline::FrameQueue;
use crate::state::SharedState;

pub const MIN_QUALITY: u8 = 10;
pub const MAX_QUALITY: u8 = 100;

pub fn clamp_quality(quality: u8) -> u8 {
    quality.clamp(MIN_QUALITY, MAX_QUALITY)
}

/// Compress a planar image to a baseline JPEG.
pub fn compress_jpeg(image: &PlanarImage, quality: u8) -> Result<Bytes> {
    let nv21 = planar_to_nv21(image)?;
    let rgb = nv21_to_rgb(&nv21, image.width as usize, image.height as usize)?;

    let mut out = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut out, clamp_quality(quality))
        .encode(&rgb, image.width, image.height, ExtendedColorType::Rgb8)
        .map_err(|e| StreamError::FrameProcessing(format!("jpeg encode: {e}")))?;

    Ok(Bytes::from(out))
}

/// Push-mode sink: compresses every delivered image and offers it to the queue.
pub struct SoftwareCompressor {
    quality: AtomicU8,
    queue: Arc<FrameQueue>,
    shared: Arc<SharedState>,
}

impl SoftwareCompressor {
    pub fn new(quality: u8, queue: Arc<FrameQueue>, shared: Arc<SharedState>) -> Self {
        Self {
            quality: AtomicU8::new(clamp_quality(quality)),
            queue,
            shared,
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality.load(Ordering::Relaxed)
    }

    /// Takes effect from the next image on.
    pub fn set_quality(&self, quality: u8) {
        self.quality.store(clamp_quality(quality), Ordering::Relaxed);
    }

    /// Compress and enqueue; a frame that cannot be processed is dropped.
    pub fn process(&self, image: PlanarImage) {
        match compress_jpeg(&image, self.quality()) {
            Ok(jpeg) => {
                trace!("Compressed {}x{} to {} bytes", image.width, image.height, jpeg.len());
                let timestamp = self.shared.timestamp_ms(image.captured_at);
                self.queue.offer(Frame::image(jpeg, timestamp));
            }
            Err(e) => {
                metrics::counter!("lenscast_frames_failed_total").increment(1);
                warn!("Dropping frame: {}", e);
            }
        }
    }
}
