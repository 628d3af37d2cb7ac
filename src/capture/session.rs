//! Binding between one open camera and the encode path's sink

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capture::{
    nearest_supported, CameraControls, CameraInfo, CameraSelector, CaptureDevice,
    CaptureProvider, CaptureRequest, CaptureSink, Size,
};
use crate::encode::{EncodePath, EncoderConfig};
use crate::error::{Result, StreamError};

/// Owns the open device. At most one device is open at any time: the old
/// one is closed, and its capture thread joined, before a new one opens.
pub struct CaptureSession {
    provider: Arc<dyn CaptureProvider>,
    device: Option<Box<dyn CaptureDevice>>,
    camera: Option<CameraInfo>,
    request: Option<CaptureRequest>,
    sink: Option<CaptureSink>,
    controls: CameraControls,
}

impl CaptureSession {
    pub fn new(provider: Arc<dyn CaptureProvider>) -> Self {
        Self {
            provider,
            device: None,
            camera: None,
            request: None,
            sink: None,
            controls: CameraControls::default(),
        }
    }

    pub fn current_camera(&self) -> Option<&CameraInfo> {
        self.camera.as_ref()
    }

    pub fn current_request(&self) -> Option<CaptureRequest> {
        self.request
    }

    pub fn controls(&self) -> &CameraControls {
        &self.controls
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    /// Resolve the camera, snap the size, bring the encode path to the
    /// matching configuration and bind the device to its sink.
    ///
    /// Called for the initial start and for every reconfiguration. When the
    /// encoder was kept and the camera is unchanged, only the frame rate is
    /// updated in place. Otherwise the device is closed before the encoder
    /// is rebuilt, so nothing renders into a surface being torn down.
    /// Lookup failures leave the open device untouched. Returns the size
    /// actually used.
    #[instrument(skip(self, template, path), fields(camera = %selector))]
    pub fn start(
        &mut self,
        selector: &CameraSelector,
        requested: Size,
        fps: u32,
        template: &EncoderConfig,
        path: &mut EncodePath,
    ) -> Result<Size> {
        let camera = self.provider.resolve(selector)?;
        let supported = self.provider.supported_sizes(&camera.id)?;
        let size = nearest_supported(&supported, requested);
        if size != requested {
            info!("Requested {} not offered by camera {}, using {}", requested, camera.id, size);
        }

        let fps = fps.max(1);
        let config = EncoderConfig {
            width: size.width,
            height: size.height,
            target_fps: fps,
            ..template.clone()
        };
        let request = CaptureRequest { size, fps };

        let reused = path.try_update(&config)?;
        let same_camera = self.camera.as_ref().is_some_and(|c| c.id == camera.id);
        let same_size = self.request.is_some_and(|r| r.size == size);

        if reused && same_camera && same_size {
            if let Some(device) = self.device.as_mut() {
                match device.set_frame_rate(fps) {
                    Ok(()) => {
                        debug!("Updated repeating request to {} fps", fps);
                        self.request = Some(request);
                        return Ok(size);
                    }
                    Err(e) => debug!("Reopening camera for rate change: {}", e),
                }
            }
        }

        self.close_device();
        if !reused {
            path.rebuild(config)?;
        }
        let sink = path.sink()?;
        self.open(&camera, request, sink)?;
        Ok(size)
    }

    /// Move the running session to another camera, keeping the sink.
    ///
    /// Returns false when `selector` already names the open camera.
    #[instrument(skip(self), fields(camera = %selector))]
    pub fn switch_camera(&mut self, selector: &CameraSelector) -> Result<bool> {
        let camera = self.provider.resolve(selector)?;
        if self.camera.as_ref().is_some_and(|c| c.id == camera.id) {
            debug!("Camera {} already active", camera.id);
            return Ok(false);
        }

        let (Some(request), Some(sink)) = (self.request, self.sink.clone()) else {
            return Err(StreamError::camera_access(
                camera.id,
                "no capture session to switch",
            ));
        };

        self.close_device();
        self.open(&camera, request, sink)?;
        Ok(true)
    }

    /// Close the device but keep camera and request for [`rebind`](Self::rebind).
    pub fn suspend(&mut self) {
        self.close_device();
    }

    /// Reopen the current camera against the encode path's present sink,
    /// after the path was rebuilt underneath it.
    pub fn rebind(&mut self, path: &EncodePath) -> Result<()> {
        let (Some(camera), Some(request)) = (self.camera.clone(), self.request) else {
            return Err(StreamError::Unsupported("no capture session to rebind".into()));
        };
        self.close_device();
        let sink = path.sink()?;
        self.open(&camera, request, sink)
    }

    /// Store and apply torch, focus and exposure settings. They are
    /// re-applied whenever a device is opened.
    pub fn apply_controls(&mut self, controls: CameraControls) -> Result<()> {
        self.controls = controls.normalized();
        match self.device.as_mut() {
            Some(device) => device.apply_controls(&self.controls),
            None => Ok(()),
        }
    }

    /// Close the device and forget the binding.
    pub fn stop(&mut self) {
        self.close_device();
        self.camera = None;
        self.request = None;
        self.sink = None;
    }

    fn open(&mut self, camera: &CameraInfo, request: CaptureRequest, sink: CaptureSink) -> Result<()> {
        let mut device = self
            .provider
            .open(camera, request, sink.clone())
            .map_err(|e| match e {
                e @ (StreamError::CameraNotFound(_)
                | StreamError::PermissionDenied(_)
                | StreamError::CameraAccess { .. }) => e,
                other => StreamError::camera_access(&camera.id, other),
            })?;

        if !self.controls.is_default() {
            if let Err(e) = device.apply_controls(&self.controls) {
                warn!("Camera {} rejected controls: {}", camera.id, e);
            }
        }

        info!("Camera {} streaming at {} @ {} fps", camera.display_name, request.size, request.fps);
        self.device = Some(device);
        self.camera = Some(camera.clone());
        self.request = Some(request);
        self.sink = Some(sink);
        Ok(())
    }

    fn close_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            debug!("Closing camera {}", device.camera_id());
            device.close();
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.close_device();
    }
}
