//! Pixel layout conversions between capture buffers and encoder inputs

use crate::capture::{chroma_len, PixelFormat, PlanarImage, Plane};
use crate::error::{Result, StreamError};

fn three_planes(image: &PlanarImage) -> Result<[&Plane; 3]> {
    if image.format != PixelFormat::Yuv420 {
        return Err(StreamError::FrameProcessing(format!(
            "expected planar YUV 4:2:0, got {:?}",
            image.format
        )));
    }
    let [y, u, v] = image.planes.as_slice() else {
        return Err(StreamError::FrameProcessing(format!(
            "expected 3 planes, got {}",
            image.planes.len()
        )));
    };

    let width = image.width as usize;
    let height = image.height as usize;
    if width == 0 || height == 0 {
        return Err(StreamError::FrameProcessing("empty image".into()));
    }
    for (name, plane, cols, rows) in [
        ("Y", y, width, height),
        ("U", u, image.chroma_width(), image.chroma_height()),
        ("V", v, image.chroma_width(), image.chroma_height()),
    ] {
        if plane.pixel_stride == 0 || plane.data.len() < plane.required_len(cols, rows) {
            return Err(StreamError::FrameProcessing(format!(
                "{name} plane too small: {} bytes for {cols}x{rows} (row stride {}, pixel stride {})",
                plane.data.len(),
                plane.row_stride,
                plane.pixel_stride
            )));
        }
    }
    Ok([y, u, v])
}

fn gather(plane: &Plane, cols: usize, rows: usize, out: &mut Vec<u8>) {
    if plane.pixel_stride == 1 && plane.row_stride == cols {
        out.extend_from_slice(&plane.data[..cols * rows]);
        return;
    }
    for row in 0..rows {
        for col in 0..cols {
            out.push(plane.sample(col, row));
        }
    }
}

/// Repack a three-plane YUV 4:2:0 image into NV21 (full Y plane followed by
/// interleaved V/U samples), honouring row and pixel strides.
pub fn planar_to_nv21(image: &PlanarImage) -> Result<Vec<u8>> {
    let [y, u, v] = three_planes(image)?;
    let width = image.width as usize;
    let height = image.height as usize;
    let chroma_width = image.chroma_width();
    let chroma_height = image.chroma_height();

    let mut nv21 = Vec::with_capacity(width * height + 2 * chroma_width * chroma_height);
    gather(y, width, height, &mut nv21);

    for row in 0..chroma_height {
        for col in 0..chroma_width {
            nv21.push(v.sample(col, row));
            nv21.push(u.sample(col, row));
        }
    }

    Ok(nv21)
}

/// Tightly packed I420 (Y, U, V planes back to back), as encoder inputs
/// expect it.
pub fn planar_to_i420(image: &PlanarImage) -> Result<Vec<u8>> {
    let [y, u, v] = three_planes(image)?;
    let width = image.width as usize;
    let height = image.height as usize;
    let chroma_width = image.chroma_width();
    let chroma_height = image.chroma_height();

    let mut i420 = Vec::with_capacity(width * height + 2 * chroma_width * chroma_height);
    gather(y, width, height, &mut i420);
    gather(u, chroma_width, chroma_height, &mut i420);
    gather(v, chroma_width, chroma_height, &mut i420);
    Ok(i420)
}

/// Split packed YUYV (4:2:2) into planar 4:2:0, averaging chroma of each
/// row pair. `row_stride` is the byte length of one source row.
pub fn yuyv_to_planar(data: &[u8], width: u32, height: u32, row_stride: usize) -> Result<PlanarImage> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 || w % 2 != 0 {
        return Err(StreamError::FrameProcessing(format!(
            "YUYV needs an even, non-zero width, got {w}x{h}"
        )));
    }
    let row_stride = row_stride.max(w * 2);
    if data.len() < (h - 1) * row_stride + w * 2 {
        return Err(StreamError::FrameProcessing(format!(
            "YUYV buffer holds {} bytes, too small for {w}x{h}",
            data.len()
        )));
    }

    let cw = chroma_len(w);
    let ch = chroma_len(h);
    let mut y = Vec::with_capacity(w * h);
    let mut u = vec![0u8; cw * ch];
    let mut v = vec![0u8; cw * ch];

    for row in 0..h {
        let line = &data[row * row_stride..row * row_stride + w * 2];
        for pair in line.chunks_exact(4) {
            y.push(pair[0]);
            y.push(pair[2]);
        }
    }

    for crow in 0..ch {
        let top = &data[(crow * 2) * row_stride..];
        let bottom = &data[((crow * 2 + 1).min(h - 1)) * row_stride..];
        for ccol in 0..cw {
            let at = ccol * 4;
            u[crow * cw + ccol] = ((u16::from(top[at + 1]) + u16::from(bottom[at + 1]) + 1) / 2) as u8;
            v[crow * cw + ccol] = ((u16::from(top[at + 3]) + u16::from(bottom[at + 3]) + 1) / 2) as u8;
        }
    }

    Ok(PlanarImage::i420(width, height, y, u, v))
}

/// BT.601 limited-range NV21 to packed RGB24.
pub fn nv21_to_rgb(nv21: &[u8], width: usize, height: usize) -> Result<Vec<u8>> {
    let chroma_width = width.div_ceil(2);
    let chroma_height = height.div_ceil(2);
    let expected = width * height + 2 * chroma_width * chroma_height;
    if nv21.len() < expected {
        return Err(StreamError::FrameProcessing(format!(
            "NV21 buffer holds {} bytes, {expected} needed",
            nv21.len()
        )));
    }

    let (luma, chroma) = nv21.split_at(width * height);
    let mut rgb = Vec::with_capacity(width * height * 3);

    for row in 0..height {
        let chroma_row = &chroma[(row / 2) * chroma_width * 2..];
        for col in 0..width {
            let c = i32::from(luma[row * width + col]) - 16;
            let d = i32::from(chroma_row[(col / 2) * 2 + 1]) - 128;
            let e = i32::from(chroma_row[(col / 2) * 2]) - 128;

            rgb.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
        }
    }

    Ok(rgb)
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn packed_planes_interleave_v_before_u() {
        let image = PlanarImage::i420(4, 2, vec![1u8; 8], vec![2u8, 3], vec![4u8, 5]);
        let nv21 = planar_to_nv21(&image).unwrap();
        assert_eq!(&nv21[..8], &[1; 8]);
        assert_eq!(&nv21[8..], &[4, 2, 5, 3]);
    }

    #[test]
    fn strided_planes_are_gathered() {
        // Y rows padded to 6 bytes, chroma stored semi-planar (pixel stride 2)
        let y = vec![10, 11, 12, 13, 0, 0, 20, 21, 22, 23, 0, 0];
        let uv = Bytes::from(vec![100, 200, 101, 201]);
        let image = PlanarImage {
            width: 4,
            height: 2,
            format: PixelFormat::Yuv420,
            planes: vec![
                Plane::packed(y, 6),
                Plane {
                    data: uv.clone(),
                    row_stride: 4,
                    pixel_stride: 2,
                },
                Plane {
                    data: uv.slice(1..),
                    row_stride: 4,
                    pixel_stride: 2,
                },
            ],
            captured_at: std::time::Instant::now(),
        };

        let nv21 = planar_to_nv21(&image).unwrap();
        assert_eq!(nv21, vec![10, 11, 12, 13, 20, 21, 22, 23, 200, 100, 201, 101]);
    }

    #[test]
    fn short_planes_are_rejected_without_panicking() {
        let image = PlanarImage::i420(4, 4, vec![0u8; 16], vec![0u8; 1], vec![0u8; 4]);
        assert!(matches!(
            planar_to_nv21(&image),
            Err(StreamError::FrameProcessing(_))
        ));
    }

    #[test]
    fn non_planar_input_is_rejected() {
        let mut image = PlanarImage::i420(2, 2, vec![0u8; 4], vec![0u8], vec![0u8]);
        image.format = PixelFormat::Rgb24;
        assert!(planar_to_nv21(&image).is_err());
    }

    #[test]
    fn neutral_chroma_maps_to_grey() {
        let nv21 = [16u8, 235, 16, 235, 128, 128];
        let rgb = nv21_to_rgb(&nv21, 2, 2).unwrap();
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..6], &[255, 255, 255]);
    }

    #[test]
    fn i420_packing_drops_padding() {
        let image = PlanarImage {
            width: 2,
            height: 2,
            format: PixelFormat::Yuv420,
            planes: vec![
                Plane::packed(vec![1, 2, 0, 3, 4, 0], 3),
                Plane::packed(vec![5], 1),
                Plane::packed(vec![6], 1),
            ],
            captured_at: std::time::Instant::now(),
        };
        assert_eq!(planar_to_i420(&image).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn yuyv_is_split_and_chroma_averaged() {
        // 2x2: row 0 = Y0 U Y1 V, row 1 likewise
        let data = [10, 100, 11, 200, 20, 110, 21, 210];
        let image = yuyv_to_planar(&data, 2, 2, 4).unwrap();
        assert_eq!(&image.planes[0].data[..], &[10, 11, 20, 21]);
        assert_eq!(&image.planes[1].data[..], &[105]);
        assert_eq!(&image.planes[2].data[..], &[205]);
    }

    #[test]
    fn yuyv_rejects_short_or_odd_input() {
        assert!(yuyv_to_planar(&[0u8; 6], 2, 2, 4).is_err());
        assert!(yuyv_to_planar(&[0u8; 12], 3, 2, 6).is_err());
    }
}
