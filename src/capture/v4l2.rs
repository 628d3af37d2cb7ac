//! Video4Linux2 camera provider
//!
//! Each open device runs its own capture thread over memory-mapped buffers.
//! YUYV frames are split into planar 4:2:0 before reaching the sink.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::provider::{
    CameraControls, CameraInfo, CaptureDevice, CaptureProvider, CaptureRequest, CaptureSink,
    Facing, HardwareEncoder,
};
use crate::capture::Size;
use crate::encode::convert::yuyv_to_planar;
use crate::encode::EncoderConfig;
use crate::error::{Result, StreamError};
use crate::CaptureConfig;

const MAX_DEVICES: usize = 10;
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_FOCUS_ABSOLUTE: u32 = 0x009a_090a;
const CID_FOCUS_AUTO: u32 = 0x009a_090c;
const CID_AUTO_EXPOSURE_BIAS: u32 = 0x009a_0913;
const CID_FLASH_LED_MODE: u32 = 0x009c_0901;

// V4L2_EXPOSURE_MANUAL / V4L2_EXPOSURE_APERTURE_PRIORITY
const EXPOSURE_MANUAL: i64 = 1;
const EXPOSURE_AUTO: i64 = 3;
// V4L2_FLASH_LED_MODE_NONE / V4L2_FLASH_LED_MODE_TORCH
const LED_NONE: i64 = 0;
const LED_TORCH: i64 = 2;

fn yuyv() -> FourCC {
    FourCC::new(b"YUYV")
}

fn access_error(path: &str, e: io::Error) -> StreamError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => StreamError::PermissionDenied(path.into()),
        io::ErrorKind::NotFound => StreamError::CameraNotFound(path.into()),
        _ => StreamError::camera_access(path, e),
    }
}

pub struct V4l2Provider {
    config: CaptureConfig,
}

impl V4l2Provider {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    fn facing(&self, path: &str, first: bool) -> Facing {
        match (&self.config.back_device, &self.config.front_device) {
            (Some(back), _) if back == path => Facing::Back,
            (_, Some(front)) if front == path => Facing::Front,
            // Without an explicit mapping the first capture device acts as the back camera
            (None, _) if first => Facing::Back,
            _ => Facing::External,
        }
    }
}

impl CaptureProvider for V4l2Provider {
    fn cameras(&self) -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();
        for i in 0..MAX_DEVICES {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(device) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                continue;
            }
            let supports_yuyv = device
                .enum_formats()
                .map(|formats| formats.iter().any(|f| f.fourcc == yuyv()))
                .unwrap_or(false);
            if !supports_yuyv {
                debug!("Skipping {} ({}): no YUYV output", path, caps.card);
                continue;
            }

            let facing = self.facing(&path, cameras.is_empty());
            let mut info = CameraInfo::new(path.clone(), facing);
            info.display_name = format!("{} ({})", caps.card, path);
            cameras.push(info);
        }
        Ok(cameras)
    }

    fn supported_sizes(&self, camera_id: &str) -> Result<Vec<Size>> {
        let device = Device::with_path(camera_id).map_err(|e| access_error(camera_id, e))?;
        let sizes = device
            .enum_framesizes(yuyv())
            .map_err(|e| access_error(camera_id, e))?
            .into_iter()
            .flat_map(|fs| match fs.size {
                FrameSizeEnum::Discrete(d) => vec![Size::new(d.width, d.height)],
                // Stepwise ranges: offer the bounds
                FrameSizeEnum::Stepwise(s) => vec![
                    Size::new(s.min_width, s.min_height),
                    Size::new(s.max_width, s.max_height),
                ],
            })
            .collect();
        Ok(sizes)
    }

    #[instrument(skip(self, sink), fields(camera = %camera.id))]
    fn open(
        &self,
        camera: &CameraInfo,
        request: CaptureRequest,
        sink: CaptureSink,
    ) -> Result<Box<dyn CaptureDevice>> {
        let path = camera.id.clone();
        let buffer_count = self.config.buffer_count.max(2);
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = flume::bounded(1);

        let handle = {
            let stop = Arc::clone(&stop);
            let path = path.clone();
            thread::Builder::new()
                .name(format!("v4l2-{}", path.trim_start_matches("/dev/")))
                .spawn(move || capture_thread(path, request, buffer_count, sink, stop, ready_tx))?
        };

        let opened = ready_rx
            .recv()
            .map_err(|_| StreamError::camera_access(&path, "capture thread exited during open"))
            .and_then(std::convert::identity);
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }

        Ok(Box::new(V4l2Device {
            path,
            stop,
            handle: Some(handle),
        }))
    }

    fn create_encoder(&self, config: &EncoderConfig) -> Result<Box<dyn HardwareEncoder>> {
        #[cfg(feature = "gstreamer-pipeline")]
        {
            Ok(Box::new(crate::capture::gst_encoder::GstEncoder::new(config)?))
        }
        #[cfg(not(feature = "gstreamer-pipeline"))]
        {
            let _ = config;
            Err(StreamError::EncoderInit(
                "built without the gstreamer-pipeline feature".into(),
            ))
        }
    }
}

/// Configure the device, report the outcome through `ready`, then stream
/// until `stop` is raised.
fn capture_thread(
    path: String,
    request: CaptureRequest,
    buffer_count: u32,
    sink: CaptureSink,
    stop: Arc<AtomicBool>,
    ready: flume::Sender<Result<()>>,
) {
    let (device, size, row_stride) = match open_device(&path, request) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&device, Type::VideoCapture, buffer_count) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(access_error(&path, e)));
            return;
        }
    };
    stream.set_timeout(DEQUEUE_TIMEOUT);
    let _ = ready.send(Ok(()));
    info!("{} streaming {} with {} buffers", path, size, buffer_count);

    while !stop.load(Ordering::Acquire) {
        let (buf, _meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!("{} dequeue failed: {}", path, e);
                thread::sleep(DEQUEUE_TIMEOUT);
                continue;
            }
        };
        let captured_at = Instant::now();

        let image = match yuyv_to_planar(buf, size.width, size.height, row_stride) {
            Ok(image) => image.with_capture_time(captured_at),
            Err(e) => {
                metrics::counter!("lenscast_frames_failed_total").increment(1);
                warn!("{} dropping frame: {}", path, e);
                continue;
            }
        };

        match &sink {
            CaptureSink::PushFrame(callback) => callback(image),
            CaptureSink::SurfaceSink(surface) => {
                if let Err(e) = surface.write_image(image) {
                    debug!("Encoder surface rejected frame: {}", e);
                }
            }
        }
    }
    debug!("{} capture thread exiting", path);
}

/// Negotiate YUYV at the requested size and rate; returns the device with
/// the size and row stride the driver settled on.
fn open_device(path: &str, request: CaptureRequest) -> Result<(Device, Size, usize)> {
    let device = Device::with_path(path).map_err(|e| access_error(path, e))?;

    let mut fmt = device.format().map_err(|e| access_error(path, e))?;
    fmt.width = request.size.width;
    fmt.height = request.size.height;
    fmt.fourcc = yuyv();
    let fmt = device.set_format(&fmt).map_err(|e| access_error(path, e))?;
    if fmt.fourcc != yuyv() {
        return Err(StreamError::camera_access(path, format!("driver chose {} instead of YUYV", fmt.fourcc)));
    }

    if let Err(e) = device.set_params(&Parameters::with_fps(request.fps.max(1))) {
        warn!("{} rejected {} fps: {}", path, request.fps, e);
    }

    let size = Size::new(fmt.width, fmt.height);
    if size != request.size {
        info!("{} negotiated {} instead of {}", path, size, request.size);
    }
    Ok((device, size, fmt.stride as usize))
}

struct V4l2Device {
    path: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl V4l2Device {
    /// Scale 0..=100 onto the control's own range.
    fn scaled(device: &Device, id: u32, percent: u8) -> i64 {
        let range = device
            .query_controls()
            .ok()
            .and_then(|all| all.into_iter().find(|c| c.id == id))
            .map(|c| (c.minimum, c.maximum));
        match range {
            Some((min, max)) => min + (max - min) * i64::from(percent.min(100)) / 100,
            None => i64::from(percent),
        }
    }
}

impl CaptureDevice for V4l2Device {
    fn camera_id(&self) -> &str {
        &self.path
    }

    fn apply_controls(&mut self, controls: &CameraControls) -> Result<()> {
        // Controls go through a second handle; the capture thread owns the stream
        let device = Device::with_path(&self.path).map_err(|e| access_error(&self.path, e))?;
        let exposure = if controls.auto_exposure {
            EXPOSURE_AUTO
        } else {
            EXPOSURE_MANUAL
        };
        let settings = [
            (CID_FLASH_LED_MODE, Value::Integer(if controls.torch { LED_TORCH } else { LED_NONE })),
            (CID_FOCUS_AUTO, Value::Boolean(controls.auto_focus)),
            (CID_EXPOSURE_AUTO, Value::Integer(exposure)),
            (CID_AUTO_EXPOSURE_BIAS, Value::Integer(i64::from(controls.exposure_compensation))),
        ];

        let mut unsupported = Vec::new();
        for (id, value) in settings {
            if device.set_control(Control { id, value }).is_err() {
                unsupported.push(format!("{id:#x}"));
            }
        }
        if !controls.auto_focus {
            let focus = Self::scaled(&device, CID_FOCUS_ABSOLUTE, controls.focus);
            if device
                .set_control(Control {
                    id: CID_FOCUS_ABSOLUTE,
                    value: Value::Integer(focus),
                })
                .is_err()
            {
                unsupported.push(format!("{CID_FOCUS_ABSOLUTE:#x}"));
            }
        }

        if unsupported.is_empty() {
            Ok(())
        } else {
            Err(StreamError::Unsupported(format!(
                "controls {} on {}",
                unsupported.join(", "),
                self.path
            )))
        }
    }

    fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            warn!("{} capture thread panicked", self.path);
        }
        info!("{} closed", self.path);
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.close();
    }
}
