//! Process-wide streaming state
//!
//! The controller is the only writer. Capture, encode and server threads read
//! snapshots through [`ArcSwap`], so no lock is ever held across I/O.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use tracing::{debug, info};

use crate::capture::{CameraControls, CameraInfo};
use crate::encode::{CodecMode, EncoderConfig};

/// Snapshot of what the session is currently doing.
#[derive(Debug, Clone, Default)]
pub struct StreamingState {
    pub running: bool,
    pub camera: Option<CameraInfo>,
    /// Effective mode, which differs from the requested one after a fallback
    pub codec_mode: Option<CodecMode>,
    pub encoder: Option<EncoderConfig>,
    pub controls: CameraControls,
    pub address: Option<String>,
}

impl StreamingState {
    pub fn target_fps(&self) -> u32 {
        self.encoder.as_ref().map_or(30, |e| e.target_fps.max(1))
    }
}

pub struct SharedState {
    running: AtomicBool,
    snapshot: ArcSwap<StreamingState>,
    codec_config: ArcSwapOption<Bytes>,
    clients: AtomicUsize,
    key_frame_wanted: AtomicBool,
    epoch: Instant,
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            snapshot: ArcSwap::from_pointee(StreamingState::default()),
            codec_config: ArcSwapOption::empty(),
            clients: AtomicUsize::new(0),
            key_frame_wanted: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn snapshot(&self) -> Arc<StreamingState> {
        self.snapshot.load_full()
    }

    pub(crate) fn publish(&self, state: StreamingState) {
        self.snapshot.store(Arc::new(state));
    }

    pub(crate) fn update(&self, f: impl FnOnce(&mut StreamingState)) {
        let mut next = StreamingState::clone(&self.snapshot.load());
        f(&mut next);
        self.publish(next);
    }

    /// Parameter sets of the current encoder, if it produced any yet.
    pub fn codec_config(&self) -> Option<Arc<Bytes>> {
        self.codec_config.load_full()
    }

    /// Cache a codec config unit. Returns false when the same bytes are
    /// already cached, so repeated units keep their identity.
    pub(crate) fn store_codec_config(&self, config: Bytes) -> bool {
        if let Some(current) = self.codec_config.load().as_deref() {
            if *current == config {
                debug!("Encoder repeated its codec config, keeping cached copy");
                return false;
            }
        }
        info!("Cached codec config ({} bytes)", config.len());
        self.codec_config.store(Some(Arc::new(config)));
        true
    }

    pub(crate) fn clear_codec_config(&self) {
        self.codec_config.store(None);
    }

    /// Ask the encoder for a key frame, e.g. because a decoder just joined.
    pub(crate) fn request_key_frame(&self) {
        self.key_frame_wanted.store(true, Ordering::Release);
    }

    /// Consume a pending key-frame request.
    pub(crate) fn take_key_frame_request(&self) -> bool {
        self.key_frame_wanted.swap(false, Ordering::AcqRel)
    }

    /// Milliseconds since the session clock started.
    pub fn timestamp_ms(&self, at: Instant) -> i64 {
        at.saturating_duration_since(self.epoch).as_millis() as i64
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub(crate) fn client_connected(&self) -> usize {
        let count = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("lenscast_clients_connected").set(count as f64);
        count
    }

    pub(crate) fn client_disconnected(&self) -> usize {
        let count = self.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("lenscast_clients_connected").set(count as f64);
        count
    }
}
