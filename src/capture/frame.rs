use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Encoded unit travelling from the encode path to the network writers.
///
/// Payload bytes are reference counted; cloning a frame never copies pixels.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable payload
    pub data: Bytes,

    /// Capture time in milliseconds on the session's monotonic clock
    pub timestamp_ms: i64,

    pub kind: FrameKind,

    /// Assigned by the queue on `offer`
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    Image,
    CodecConfig,
    AccessUnit,
}

impl Frame {
    pub fn new(kind: FrameKind, data: Bytes, timestamp_ms: i64) -> Self {
        Self {
            data,
            timestamp_ms,
            kind,
            sequence: 0,
        }
    }

    pub fn image(data: Bytes, timestamp_ms: i64) -> Self {
        Self::new(FrameKind::Image, data, timestamp_ms)
    }

    pub fn access_unit(data: Bytes, timestamp_ms: i64) -> Self {
        Self::new(FrameKind::AccessUnit, data, timestamp_ms)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Pixel layouts a capture provider may deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Three-plane YUV 4:2:0 with arbitrary row and pixel strides
    Yuv420,
    Yuyv4,
    Rgb24,
}

/// One plane of a planar image.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    pub row_stride: usize,
    /// Distance between horizontally adjacent samples (2 for semi-planar chroma)
    pub pixel_stride: usize,
}

impl Plane {
    pub fn packed(data: impl Into<Bytes>, row_stride: usize) -> Self {
        Self {
            data: data.into(),
            row_stride,
            pixel_stride: 1,
        }
    }

    /// Smallest buffer length able to hold `rows` x `cols` samples.
    pub(crate) fn required_len(&self, cols: usize, rows: usize) -> usize {
        if cols == 0 || rows == 0 {
            return 0;
        }
        (rows - 1) * self.row_stride + (cols - 1) * self.pixel_stride + 1
    }

    #[inline]
    pub(crate) fn sample(&self, col: usize, row: usize) -> u8 {
        self.data[row * self.row_stride + col * self.pixel_stride]
    }
}

/// Raw picture handed over by the capture provider in push mode.
#[derive(Debug, Clone)]
pub struct PlanarImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<Plane>,
    pub captured_at: Instant,
}

impl PlanarImage {
    /// Tightly packed I420 image (Y, then U, then V at half resolution).
    pub fn i420(
        width: u32,
        height: u32,
        y: impl Into<Bytes>,
        u: impl Into<Bytes>,
        v: impl Into<Bytes>,
    ) -> Self {
        let chroma_stride = chroma_len(width as usize);
        Self {
            width,
            height,
            format: PixelFormat::Yuv420,
            planes: vec![
                Plane::packed(y, width as usize),
                Plane::packed(u, chroma_stride),
                Plane::packed(v, chroma_stride),
            ],
            captured_at: Instant::now(),
        }
    }

    pub fn with_capture_time(mut self, captured_at: Instant) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn chroma_width(&self) -> usize {
        chroma_len(self.width as usize)
    }

    pub fn chroma_height(&self) -> usize {
        chroma_len(self.height as usize)
    }
}

/// Subsampled chroma dimension for a 4:2:0 layout; odd sizes round up.
#[inline]
pub fn chroma_len(luma: usize) -> usize {
    luma.div_ceil(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i420_plane_strides_follow_dimensions() {
        let image = PlanarImage::i420(6, 4, vec![0u8; 24], vec![0u8; 6], vec![0u8; 6]);
        assert_eq!(image.planes[0].row_stride, 6);
        assert_eq!(image.planes[1].row_stride, 3);
        assert_eq!(image.chroma_height(), 2);
    }

    #[test]
    fn required_len_accounts_for_pixel_stride() {
        let plane = Plane {
            data: Bytes::from_static(&[0; 16]),
            row_stride: 8,
            pixel_stride: 2,
        };
        // last sample of the second row sits at 8 + 3 * 2
        assert_eq!(plane.required_len(4, 2), 15);
        assert_eq!(plane.required_len(0, 2), 0);
    }
}
