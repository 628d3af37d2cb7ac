//! Synthetic camera provider
//!
//! Renders a moving test pattern at the requested size and frame rate, and
//! ships a virtual H.264-shaped encoder so the surface path can run without
//! hardware. Faults can be injected for exercising the recovery paths.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::capture::provider::{
    CameraControls, CameraInfo, CaptureDevice, CaptureProvider, CaptureRequest, CaptureSink,
    EncoderOutput, EncoderSurface, Facing, HardwareEncoder,
};
use crate::capture::{chroma_len, PlanarImage, Size};
use crate::encode::EncoderConfig;
use crate::error::{Result, StreamError};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Faults the virtual encoder can simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderFault {
    /// `start()` fails, as a codec that cannot be configured would
    Start,
    /// Output polling errors out after this many access units
    AfterUnits(u64),
}

/// Counters shared between the provider and everything it opened.
#[derive(Debug, Default)]
pub struct VirtualStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    encoders: AtomicUsize,
    stops_while_capturing: AtomicUsize,
    key_frame_requests: AtomicUsize,
    controls: Mutex<Option<CameraControls>>,
}

impl VirtualStats {
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open devices ever observed.
    pub fn max_concurrent_devices(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.load(Ordering::SeqCst)
    }

    /// Encoders stopped while some device was still rendering into them.
    pub fn encoder_stops_while_capturing(&self) -> usize {
        self.stops_while_capturing.load(Ordering::SeqCst)
    }

    pub fn key_frame_requests(&self) -> usize {
        self.key_frame_requests.load(Ordering::SeqCst)
    }

    pub fn last_controls(&self) -> Option<CameraControls> {
        self.controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub struct VirtualProvider {
    cameras: Vec<CameraInfo>,
    sizes: Vec<Size>,
    hardware_encoder: bool,
    denied: Vec<String>,
    encoder_fault: Option<EncoderFault>,
    stats: Arc<VirtualStats>,
}

impl Default for VirtualProvider {
    fn default() -> Self {
        Self {
            cameras: vec![
                CameraInfo::new("0", Facing::Back),
                CameraInfo::new("1", Facing::Front),
            ],
            sizes: vec![
                Size::new(640, 480),
                Size::new(1280, 720),
                Size::new(1920, 1080),
            ],
            hardware_encoder: true,
            denied: Vec::new(),
            encoder_fault: None,
            stats: Arc::new(VirtualStats::default()),
        }
    }
}

impl VirtualProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sizes(mut self, sizes: Vec<Size>) -> Self {
        self.sizes = sizes;
        self
    }

    pub fn with_camera(mut self, camera: CameraInfo) -> Self {
        self.cameras.push(camera);
        self
    }

    pub fn without_hardware_encoder(mut self) -> Self {
        self.hardware_encoder = false;
        self
    }

    /// Opening this camera fails with a permission error.
    pub fn deny_camera(mut self, id: impl Into<String>) -> Self {
        self.denied.push(id.into());
        self
    }

    pub fn with_encoder_fault(mut self, fault: EncoderFault) -> Self {
        self.encoder_fault = Some(fault);
        self
    }

    pub fn stats(&self) -> Arc<VirtualStats> {
        Arc::clone(&self.stats)
    }

    fn camera_tag(&self, id: &str) -> u8 {
        let index = self.cameras.iter().position(|c| c.id == id).unwrap_or(0);
        64u8.wrapping_add((index as u8).wrapping_mul(32))
    }
}

impl CaptureProvider for VirtualProvider {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        Ok(self.cameras.clone())
    }

    fn supported_sizes(&self, camera_id: &str) -> Result<Vec<Size>> {
        if !self.cameras.iter().any(|c| c.id == camera_id) {
            return Err(StreamError::CameraNotFound(camera_id.into()));
        }
        Ok(self.sizes.clone())
    }

    fn open(
        &self,
        camera: &CameraInfo,
        request: CaptureRequest,
        sink: CaptureSink,
    ) -> Result<Box<dyn CaptureDevice>> {
        if self.denied.contains(&camera.id) {
            return Err(StreamError::PermissionDenied(camera.id.clone()));
        }
        if !self.cameras.contains(camera) {
            return Err(StreamError::CameraNotFound(camera.id.clone()));
        }

        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);
        self.stats.opens.fetch_add(1, Ordering::SeqCst);

        info!(
            "Opening virtual camera {} at {} @ {} fps ({:?})",
            camera.display_name, request.size, request.fps, sink
        );

        let stop = Arc::new(AtomicBool::new(false));
        let fps = Arc::new(AtomicU32::new(request.fps.max(1)));
        let tag = self.camera_tag(&camera.id);
        let handle = {
            let stop = Arc::clone(&stop);
            let fps = Arc::clone(&fps);
            thread::Builder::new()
                .name(format!("virtual-cam-{}", camera.id))
                .spawn(move || render_loop(request.size, tag, fps, stop, sink))?
        };

        Ok(Box::new(VirtualDevice {
            camera_id: camera.id.clone(),
            stop,
            fps,
            handle: Some(handle),
            stats: Arc::clone(&self.stats),
        }))
    }

    fn create_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn HardwareEncoder>> {
        if !self.hardware_encoder {
            return Err(StreamError::EncoderInit(
                "virtual provider has no encoder".into(),
            ));
        }
        self.stats.encoders.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualEncoder::new(
            config,
            self.encoder_fault,
            Arc::clone(&self.stats),
        )))
    }
}

fn render_loop(
    size: Size,
    tag: u8,
    fps: Arc<AtomicU32>,
    stop: Arc<AtomicBool>,
    sink: CaptureSink,
) {
    let mut frame_no: u32 = 0;
    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();
        let image = test_pattern(size, frame_no, tag);
        match &sink {
            CaptureSink::PushFrame(callback) => callback(image),
            CaptureSink::SurfaceSink(surface) => {
                if let Err(e) = surface.write_image(image) {
                    debug!("Surface rejected frame: {}", e);
                }
            }
        }
        frame_no = frame_no.wrapping_add(1);

        let interval = Duration::from_millis(1000 / u64::from(fps.load(Ordering::Relaxed).max(1)));
        if let Some(remaining) = interval.checked_sub(started.elapsed()) {
            thread::sleep(remaining);
        }
    }
}

/// Diagonal luma ramp that scrolls each frame; chroma carries the camera tag.
fn test_pattern(size: Size, frame_no: u32, tag: u8) -> PlanarImage {
    let width = size.width as usize;
    let height = size.height as usize;
    let shift = (frame_no as usize).wrapping_mul(4);

    let mut y = vec![0u8; width * height];
    for (row, line) in y.chunks_exact_mut(width.max(1)).enumerate() {
        for (col, px) in line.iter_mut().enumerate() {
            *px = 16 + ((col + row + shift) % 220) as u8;
        }
    }

    let chroma = chroma_len(width) * chroma_len(height);
    PlanarImage::i420(size.width, size.height, y, vec![tag; chroma], vec![128u8; chroma])
}

struct VirtualDevice {
    camera_id: String,
    stop: Arc<AtomicBool>,
    fps: Arc<AtomicU32>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<VirtualStats>,
}

impl CaptureDevice for VirtualDevice {
    fn camera_id(&self) -> &str {
        &self.camera_id
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        self.fps.store(fps.max(1), Ordering::Relaxed);
        Ok(())
    }

    fn apply_controls(&mut self, controls: &CameraControls) -> Result<()> {
        *self
            .stats
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(controls.clone());
        Ok(())
    }

    fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("Virtual camera {} thread panicked", self.camera_id);
        }
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        debug!("Virtual camera {} closed", self.camera_id);
    }
}

impl Drop for VirtualDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct VirtualSurface {
    tx: flume::Sender<PlanarImage>,
}

impl EncoderSurface for VirtualSurface {
    fn write_image(&self, image: PlanarImage) -> Result<()> {
        match self.tx.try_send(image) {
            // encoder is behind; the frame is simply not encoded
            Ok(()) | Err(flume::TrySendError::Full(_)) => Ok(()),
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(StreamError::Encoder("encoder surface released".into()))
            }
        }
    }
}

/// Emits one parameter-set unit after start, then one key-frame access unit
/// per surface image.
struct VirtualEncoder {
    size: Size,
    bitrate: u32,
    surface: Arc<VirtualSurface>,
    frames: flume::Receiver<PlanarImage>,
    started: bool,
    config_pending: bool,
    units: u64,
    fault: Option<EncoderFault>,
    stats: Arc<VirtualStats>,
}

impl VirtualEncoder {
    fn new(config: &EncoderConfig, fault: Option<EncoderFault>, stats: Arc<VirtualStats>) -> Self {
        let (tx, frames) = flume::bounded(2);
        Self {
            size: config.size(),
            bitrate: config.effective_bitrate(),
            surface: Arc::new(VirtualSurface { tx }),
            frames,
            started: false,
            config_pending: false,
            units: 0,
            fault,
            stats,
        }
    }

    fn parameter_sets(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_slice(&START_CODE);
        buf.put_slice(&[0x67, 0x42, 0x00, 0x1f]);
        buf.put_u16(self.size.width as u16);
        buf.put_u16(self.size.height as u16);
        buf.put_slice(&START_CODE);
        buf.put_slice(&[0x68, 0xce, 0x3c, 0x80]);
        buf.freeze()
    }

    fn access_unit(&self, image: &PlanarImage) -> Bytes {
        let luma = image.planes.first().and_then(|p| p.data.first()).copied();
        let chroma = image.planes.get(1).and_then(|p| p.data.first()).copied();

        let mut buf = BytesMut::with_capacity(16);
        buf.put_slice(&START_CODE);
        buf.put_u8(0x65);
        buf.put_u32(self.units as u32);
        buf.put_u32(self.bitrate);
        buf.put_u8(luma.unwrap_or(0));
        buf.put_u8(chroma.unwrap_or(0));
        buf.freeze()
    }
}

impl HardwareEncoder for VirtualEncoder {
    fn input_surface(&self) -> Arc<dyn EncoderSurface> {
        self.surface.clone()
    }

    fn start(&mut self) -> Result<()> {
        if self.fault == Some(EncoderFault::Start) {
            return Err(StreamError::EncoderInit(
                "virtual encoder refused configuration".into(),
            ));
        }
        self.started = true;
        self.config_pending = true;
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
        if !self.started {
            return Err(StreamError::Encoder("encoder not started".into()));
        }
        if let Some(EncoderFault::AfterUnits(limit)) = self.fault {
            if self.units >= limit {
                return Err(StreamError::Encoder("virtual encoder fault".into()));
            }
        }
        if self.config_pending {
            self.config_pending = false;
            return Ok(EncoderOutput::Config(self.parameter_sets()));
        }

        match self.frames.recv_timeout(timeout) {
            Ok(image) => {
                let data = self.access_unit(&image);
                self.units += 1;
                Ok(EncoderOutput::AccessUnit {
                    data,
                    key_frame: true,
                    captured_at: Some(image.captured_at),
                })
            }
            Err(_) => Ok(EncoderOutput::TryAgain),
        }
    }

    fn supports_live_bitrate(&self) -> bool {
        true
    }

    fn set_bitrate(&mut self, bits_per_second: u32) -> Result<()> {
        self.bitrate = bits_per_second;
        Ok(())
    }

    fn request_key_frame(&mut self) {
        // Every unit is already a key frame
        self.stats.key_frame_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&mut self) {
        if self.started && self.stats.active.load(Ordering::SeqCst) > 0 {
            warn!("Virtual encoder stopped while a camera is still rendering");
            self.stats.stops_while_capturing.fetch_add(1, Ordering::SeqCst);
        }
        self.started = false;
        self.frames.drain().for_each(drop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CameraSelector;
    use crate::encode::CodecMode;

    #[test]
    fn resolves_selectors_by_facing_and_id() {
        let provider = VirtualProvider::new();
        assert_eq!(provider.resolve(&CameraSelector::Back).unwrap().id, "0");
        assert_eq!(provider.resolve(&CameraSelector::Front).unwrap().id, "1");
        assert_eq!(
            provider.resolve(&CameraSelector::Id("1".into())).unwrap().facing,
            Facing::Front
        );
        assert!(matches!(
            provider.resolve(&CameraSelector::Id("9".into())),
            Err(StreamError::CameraNotFound(_))
        ));
    }

    #[test]
    fn denied_camera_reports_permission_error() {
        let provider = VirtualProvider::new().deny_camera("0");
        let camera = provider.resolve(&CameraSelector::Back).unwrap();
        let sink = CaptureSink::PushFrame(Arc::new(|_| {}));
        let request = CaptureRequest {
            size: Size::new(64, 48),
            fps: 30,
        };
        assert!(matches!(
            provider.open(&camera, request, sink),
            Err(StreamError::PermissionDenied(_))
        ));
        assert_eq!(provider.stats().open_count(), 0);
    }

    #[test]
    fn push_device_delivers_images_until_closed() {
        let provider = VirtualProvider::new();
        let camera = provider.resolve(&CameraSelector::Back).unwrap();
        let (tx, rx) = flume::unbounded();
        let sink = CaptureSink::PushFrame(Arc::new(move |image| {
            let _ = tx.send(image);
        }));
        let request = CaptureRequest {
            size: Size::new(32, 16),
            fps: 60,
        };

        let mut device = provider.open(&camera, request, sink).unwrap();
        let image = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!((image.width, image.height), (32, 16));
        assert_eq!(image.planes[1].data.len(), 16 * 8);

        device.close();
        let stats = provider.stats();
        assert_eq!(stats.close_count(), 1);
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn encoder_emits_config_before_access_units() {
        let provider = VirtualProvider::new();
        let config = EncoderConfig {
            width: 64,
            height: 48,
            codec_mode: CodecMode::Hardware,
            ..Default::default()
        };
        let mut encoder = provider.create_encoder(&config).unwrap();
        encoder.start().unwrap();

        let surface = encoder.input_surface();
        surface
            .write_image(test_pattern(Size::new(64, 48), 0, 99))
            .unwrap();

        let first = encoder.dequeue_output(Duration::from_millis(50)).unwrap();
        assert!(matches!(first, EncoderOutput::Config(_)));

        match encoder.dequeue_output(Duration::from_millis(50)).unwrap() {
            EncoderOutput::AccessUnit { data, key_frame, .. } => {
                assert!(key_frame);
                assert_eq!(&data[..5], &[0, 0, 0, 1, 0x65]);
                assert_eq!(*data.last().unwrap(), 99);
            }
            other => panic!("unexpected output {other:?}"),
        }

        assert!(matches!(
            encoder.dequeue_output(Duration::from_millis(10)).unwrap(),
            EncoderOutput::TryAgain
        ));
    }
}
