//! Session coordinator
//!
//! The single writer of [`SharedState`]. Every control operation runs on the
//! caller's thread through `&mut self`; capture, encode and client threads
//! only ever read.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::capture::{
    CameraControls, CameraInfo, CameraSelector, CaptureProvider, CaptureSession, Size,
};
use crate::encode::{CodecMode, EncodePath, EncoderConfig};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::pipeline::FrameQueue;
use crate::server::StreamServer;
use crate::state::{SharedState, StreamingState};
use crate::{Config, ServerConfig};

/// Result of a control operation that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Started,
    /// `start` while running; nothing changed
    AlreadyRunning,
    Switched,
    /// The requested state was already in effect
    Unchanged,
    Reconfigured,
    Stopped,
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub host: String,
    pub port: u16,
    pub camera: CameraSelector,
    pub size: Size,
    pub fps: u32,
    pub jpeg_quality: u8,
    pub bitrate: Option<u32>,
    pub codec_mode: CodecMode,
}

impl Default for StartRequest {
    fn default() -> Self {
        Config::default().start_request()
    }
}

/// Parameters to change on a running session; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigureRequest {
    pub size: Option<Size>,
    pub fps: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub bitrate: Option<u32>,
    pub codec_mode: Option<CodecMode>,
}

/// Read-back for the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub running: bool,
    pub camera: Option<String>,
    pub resolution: Option<String>,
    pub fps: Option<u32>,
    pub codec: Option<CodecMode>,
    pub clients: usize,
    pub address: Option<String>,
}

struct ActiveSession {
    server: StreamServer,
    capture: CaptureSession,
    encode: EncodePath,
    request: StartRequest,
}

pub struct SessionController {
    provider: Arc<dyn CaptureProvider>,
    shared: Arc<SharedState>,
    queue: Arc<FrameQueue>,
    events: EventBus,
    server_config: ServerConfig,
    key_frame_interval_secs: u32,
    drain_timeout: Duration,
    controls: CameraControls,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(provider: Arc<dyn CaptureProvider>, config: &Config) -> Self {
        Self {
            provider,
            shared: Arc::new(SharedState::new()),
            queue: Arc::new(FrameQueue::new(config.pipeline.queue_capacity)),
            events: EventBus::new(),
            server_config: config.server.clone(),
            key_frame_interval_secs: config.encoder.key_frame_interval_secs.max(1),
            drain_timeout: Duration::from_millis(config.encoder.drain_timeout_ms.max(1)),
            controls: CameraControls::default(),
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some() && self.shared.is_running()
    }

    pub fn shared(&self) -> Arc<SharedState> {
        Arc::clone(&self.shared)
    }

    pub fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.queue)
    }

    pub fn subscribe(&self) -> flume::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Address the server actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|a| a.server.local_addr())
    }

    pub fn cameras(&self) -> Result<Vec<CameraInfo>> {
        self.provider.cameras()
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.shared.snapshot();
        StreamStatus {
            running: self.shared.is_running(),
            camera: state.camera.as_ref().map(|c| c.id.clone()),
            resolution: state.encoder.as_ref().map(|e| e.size().to_string()),
            fps: state.encoder.as_ref().map(|e| e.target_fps),
            codec: state.codec_mode,
            clients: self.shared.client_count(),
            address: state.address.clone(),
        }
    }

    fn template(&self, request: &StartRequest) -> EncoderConfig {
        EncoderConfig {
            width: request.size.width,
            height: request.size.height,
            target_fps: request.fps.max(1),
            jpeg_quality: request.jpeg_quality,
            bitrate: request.bitrate,
            codec_mode: request.codec_mode,
            key_frame_interval_secs: self.key_frame_interval_secs,
        }
    }

    /// Bind, bring up the encode path and camera, then accept clients.
    /// A second call while running reports [`ControlOutcome::AlreadyRunning`].
    #[instrument(skip(self, request), fields(addr = %format!("{}:{}", request.host, request.port)))]
    pub fn start(&mut self, request: StartRequest) -> Result<ControlOutcome> {
        if self.active.is_some() {
            info!("Start requested while running, ignoring");
            return Ok(ControlOutcome::AlreadyRunning);
        }

        match self.bring_up(request) {
            Ok(session) => {
                let address = session.server.local_addr().to_string();
                let camera = session.capture.current_camera().cloned();
                let config = session.encode.config().cloned();
                let codec = session.encode.mode().unwrap_or_default();
                self.active = Some(session);

                if let (Some(camera), Some(config)) = (camera, config) {
                    info!("Streaming {} at {} from {}", codec, config.size(), address);
                    self.events.emit(StreamEvent::Started {
                        address,
                        camera,
                        size: config.size(),
                        codec,
                    });
                }
                Ok(ControlOutcome::Started)
            }
            Err(e) => {
                error!("Start failed: {}", e);
                self.shared.set_running(false);
                self.shared.publish(StreamingState::default());
                self.events.emit(StreamEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Everything built here is dropped, and thereby torn down, when a
    /// later step fails.
    fn bring_up(&mut self, request: StartRequest) -> Result<ActiveSession> {
        let mut server = StreamServer::bind(&request.host, request.port, self.server_config.clone())?;

        let template = self.template(&request);
        let mut encode = EncodePath::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.queue),
            Arc::clone(&self.shared),
            self.events.clone(),
            self.drain_timeout,
        );
        let mut capture = CaptureSession::new(Arc::clone(&self.provider));
        capture.apply_controls(self.controls.clone())?;

        self.queue.clear();
        capture.start(&request.camera, request.size, request.fps, &template, &mut encode)?;

        self.shared.publish(StreamingState {
            running: true,
            camera: capture.current_camera().cloned(),
            codec_mode: encode.mode(),
            encoder: encode.config().cloned(),
            controls: self.controls.clone(),
            address: Some(server.local_addr().to_string()),
        });
        self.shared.set_running(true);

        server.serve(Arc::clone(&self.shared), Arc::clone(&self.queue))?;

        Ok(ActiveSession {
            server,
            capture,
            encode,
            request,
        })
    }

    /// Move to another camera while clients stay connected.
    #[instrument(skip(self), fields(camera = %selector))]
    pub fn switch_camera(&mut self, selector: CameraSelector) -> Result<ControlOutcome> {
        let Some(active) = self.active.as_mut() else {
            return Ok(ControlOutcome::NotRunning);
        };

        match active.capture.switch_camera(&selector) {
            Ok(false) => Ok(ControlOutcome::Unchanged),
            Ok(true) => {
                active.request.camera = selector;
                let camera = active.capture.current_camera().cloned();
                self.shared.update(|state| state.camera = camera.clone());
                if let Some(camera) = camera {
                    self.events.emit(StreamEvent::CameraSwitched { camera });
                }
                Ok(ControlOutcome::Switched)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Change size, rate, quality, bitrate or codec mode in place.
    #[instrument(skip(self))]
    pub fn reconfigure(&mut self, changes: ReconfigureRequest) -> Result<ControlOutcome> {
        let Some(active) = self.active.as_ref() else {
            return Ok(ControlOutcome::NotRunning);
        };

        let mut request = active.request.clone();
        request.size = changes.size.unwrap_or(request.size);
        request.fps = changes.fps.unwrap_or(request.fps).max(1);
        request.jpeg_quality = changes.jpeg_quality.unwrap_or(request.jpeg_quality);
        request.bitrate = changes.bitrate.or(request.bitrate);
        request.codec_mode = changes.codec_mode.unwrap_or(request.codec_mode);

        if request == active.request {
            return Ok(ControlOutcome::Unchanged);
        }

        let template = self.template(&request);
        let Some(active) = self.active.as_mut() else {
            return Ok(ControlOutcome::NotRunning);
        };
        // Stay on the camera that is actually open
        let selector = active
            .capture
            .current_camera()
            .map(|c| CameraSelector::Id(c.id.clone()))
            .unwrap_or_else(|| request.camera.clone());

        let result = active
            .capture
            .start(&selector, request.size, request.fps, &template, &mut active.encode);
        match result {
            Ok(size) => {
                active.request = request;
                self.publish_encoder();
                self.emit_reconfigured(size);
                Ok(ControlOutcome::Reconfigured)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Store camera controls; applied immediately when running and again
    /// after every camera switch.
    pub fn set_controls(&mut self, controls: CameraControls) -> Result<()> {
        self.controls = controls.normalized();
        if let Some(active) = self.active.as_mut() {
            match active.capture.apply_controls(self.controls.clone()) {
                Ok(()) => {}
                Err(StreamError::Unsupported(what)) => {
                    warn!("Camera does not support {}", what)
                }
                Err(e) => return Err(e),
            }
            let controls = self.controls.clone();
            self.shared.update(|state| state.controls = controls);
        }
        Ok(())
    }

    /// Rebuild the pipeline in software mode after the hardware encoder died.
    /// Connected clients are not touched.
    #[instrument(skip(self))]
    pub fn fallback_to_software(&mut self) -> Result<ControlOutcome> {
        let Some(active) = self.active.as_mut() else {
            return Ok(ControlOutcome::NotRunning);
        };
        if active.encode.mode() == Some(CodecMode::Software) {
            return Ok(ControlOutcome::Unchanged);
        }

        warn!("Switching to software compression");
        active.capture.suspend();
        let result = active
            .encode
            .fallback_to_software()
            .and_then(|()| active.capture.rebind(&active.encode));
        match result {
            Ok(()) => {
                active.request.codec_mode = CodecMode::Software;
                let size = active.encode.config().map(EncoderConfig::size);
                self.publish_encoder();
                if let Some(size) = size {
                    self.emit_reconfigured(size);
                }
                Ok(ControlOutcome::Reconfigured)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Tear down camera, encoder and server. Clients see the running flag
    /// drop and their sockets close.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> ControlOutcome {
        let Some(mut active) = self.active.take() else {
            return ControlOutcome::NotRunning;
        };

        self.shared.set_running(false);
        active.capture.stop();
        active.encode.stop();
        active.server.shutdown();
        self.queue.clear();
        self.shared.clear_codec_config();
        self.shared.publish(StreamingState::default());

        info!("Streaming stopped");
        self.events.emit(StreamEvent::Stopped);
        ControlOutcome::Stopped
    }

    fn publish_encoder(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let codec_mode = active.encode.mode();
        let encoder = active.encode.config().cloned();
        let camera = active.capture.current_camera().cloned();
        self.shared.update(|state| {
            state.codec_mode = codec_mode;
            state.encoder = encoder;
            state.camera = camera;
        });
    }

    fn emit_reconfigured(&self, size: Size) {
        let state = self.shared.snapshot();
        self.events.emit(StreamEvent::Reconfigured {
            size,
            fps: state.target_fps(),
            codec: state.codec_mode.unwrap_or_default(),
        });
    }

    /// Report a failed control operation. The session keeps streaming when
    /// the camera is still open (a lookup failed before anything was torn
    /// down); otherwise it is stopped.
    fn fail(&mut self, e: StreamError) -> StreamError {
        error!("Control operation failed: {}", e);
        self.events.emit(StreamEvent::Error {
            message: e.to_string(),
        });
        let camera_lost = self
            .active
            .as_ref()
            .is_some_and(|active| !active.capture.is_open());
        if camera_lost {
            if !e.stops_stream() {
                warn!("Camera left closed after a {:?} failure", e.category());
            }
            self.stop();
        }
        e
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VirtualProvider;

    fn request() -> StartRequest {
        StartRequest {
            host: "127.0.0.1".into(),
            port: 0,
            size: Size::new(640, 480),
            ..StartRequest::default()
        }
    }

    fn controller(provider: VirtualProvider) -> SessionController {
        SessionController::new(Arc::new(provider), &Config::default())
    }

    #[test]
    fn start_is_idempotent() {
        let mut controller = controller(VirtualProvider::new());
        assert_eq!(controller.start(request()).unwrap(), ControlOutcome::Started);
        let addr = controller.local_addr();
        assert_eq!(controller.start(request()).unwrap(), ControlOutcome::AlreadyRunning);
        assert_eq!(controller.local_addr(), addr);
        assert_eq!(controller.stop(), ControlOutcome::Stopped);
        assert_eq!(controller.stop(), ControlOutcome::NotRunning);
    }

    #[test]
    fn status_reflects_the_session() {
        let mut controller = controller(VirtualProvider::new());
        assert!(!controller.status().running);

        controller.start(request()).unwrap();
        let status = controller.status();
        assert!(status.running);
        assert_eq!(status.camera.as_deref(), Some("0"));
        assert_eq!(status.resolution.as_deref(), Some("640x480"));
        assert_eq!(status.fps, Some(30));
        assert_eq!(status.codec, Some(CodecMode::Software));

        controller.stop();
        assert_eq!(controller.status().camera, None);
    }

    #[test]
    fn missing_camera_leaves_session_stopped() {
        let mut controller = controller(VirtualProvider::new());
        let events = controller.subscribe();
        let err = controller
            .start(StartRequest {
                camera: CameraSelector::Id("42".into()),
                ..request()
            })
            .unwrap_err();

        assert!(matches!(err, StreamError::CameraNotFound(_)));
        assert!(!controller.is_running());
        assert!(controller.local_addr().is_none());
        assert!(matches!(events.try_recv(), Ok(StreamEvent::Error { .. })));
    }

    #[test]
    fn operations_on_a_stopped_session_report_not_running() {
        let mut controller = controller(VirtualProvider::new());
        assert_eq!(
            controller.switch_camera(CameraSelector::Front).unwrap(),
            ControlOutcome::NotRunning
        );
        assert_eq!(
            controller.reconfigure(ReconfigureRequest::default()).unwrap(),
            ControlOutcome::NotRunning
        );
        assert_eq!(
            controller.fallback_to_software().unwrap(),
            ControlOutcome::NotRunning
        );
    }

    #[test]
    fn denied_switch_stops_streaming() {
        let mut controller = controller(VirtualProvider::new().deny_camera("1"));
        controller.start(request()).unwrap();

        let err = controller.switch_camera(CameraSelector::Front).unwrap_err();
        assert!(matches!(err, StreamError::PermissionDenied(_)));
        assert!(!controller.is_running());
        assert!(!controller.shared().is_running());
    }

    #[test]
    fn unknown_camera_switch_keeps_streaming() {
        let provider = VirtualProvider::new();
        let stats = provider.stats();
        let mut controller = controller(provider);
        let events = controller.subscribe();
        controller.start(request()).unwrap();

        let err = controller
            .switch_camera(CameraSelector::Id("nope".into()))
            .unwrap_err();
        assert!(matches!(err, StreamError::CameraNotFound(_)));
        assert!(controller.is_running());
        assert_eq!(controller.status().camera.as_deref(), Some("0"));
        assert_eq!(stats.close_count(), 0);

        let emitted: Vec<_> = events.try_iter().collect();
        assert!(emitted.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
        assert!(!emitted.contains(&StreamEvent::Stopped));
    }

    #[test]
    fn rebuilding_reconfigure_closes_the_camera_first() {
        let provider = VirtualProvider::new();
        let stats = provider.stats();
        let mut controller = controller(provider);
        controller
            .start(StartRequest {
                codec_mode: CodecMode::Hardware,
                ..request()
            })
            .unwrap();

        controller
            .reconfigure(ReconfigureRequest {
                size: Some(Size::new(1280, 720)),
                ..Default::default()
            })
            .unwrap();
        controller.fallback_to_software().unwrap();

        assert_eq!(stats.encoder_count(), 2);
        assert_eq!(stats.encoder_stops_while_capturing(), 0);
        assert_eq!(stats.max_concurrent_devices(), 1);
        assert_eq!(controller.status().codec, Some(CodecMode::Software));
        assert_eq!(controller.status().resolution.as_deref(), Some("1280x720"));
    }

    #[test]
    fn controls_are_kept_in_state() {
        let provider = VirtualProvider::new();
        let stats = provider.stats();
        let mut controller = controller(provider);
        controller
            .set_controls(CameraControls {
                torch: true,
                ..Default::default()
            })
            .unwrap();

        controller.start(request()).unwrap();
        assert!(controller.shared().snapshot().controls.torch);
        assert!(stats.last_controls().unwrap().torch);
    }

    #[test]
    fn reconfigure_without_changes_is_unchanged() {
        let mut controller = controller(VirtualProvider::new());
        controller.start(request()).unwrap();
        assert_eq!(
            controller
                .reconfigure(ReconfigureRequest {
                    fps: Some(30),
                    ..Default::default()
                })
                .unwrap(),
            ControlOutcome::Unchanged
        );
    }
}
