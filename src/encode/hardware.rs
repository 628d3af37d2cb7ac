//! Surface encode path: the camera renders into the encoder, a drain thread
//! pulls compressed units out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::{EncoderOutput, EncoderSurface, Frame, HardwareEncoder};
use crate::error::{Result, StreamError};
use crate::events::{EventBus, StreamEvent};
use crate::pipeline::FrameQueue;
use crate::state::SharedState;

/// Requests applied by the drain thread between two output polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderCommand {
    SetBitrate(u32),
}

/// Everything the drain thread publishes into.
#[derive(Clone)]
pub struct DrainContext {
    pub queue: Arc<FrameQueue>,
    pub shared: Arc<SharedState>,
    pub events: EventBus,
    pub poll_timeout: Duration,
}

/// A started hardware encoder plus its drain thread.
///
/// The encoder is moved into the drain thread, so exactly one thread ever
/// touches it; control requests travel as [`EncoderCommand`]s.
pub struct HardwareSession {
    surface: Arc<dyn EncoderSurface>,
    commands: flume::Sender<EncoderCommand>,
    stop: Arc<AtomicBool>,
    live_bitrate: bool,
    handle: Option<JoinHandle<()>>,
}

impl HardwareSession {
    pub fn start(mut encoder: Box<dyn HardwareEncoder>, ctx: DrainContext) -> Result<Self> {
        encoder.start().map_err(|e| match e {
            StreamError::EncoderInit(reason) => StreamError::EncoderInit(reason),
            other => StreamError::EncoderInit(other.to_string()),
        })?;

        let surface = encoder.input_surface();
        let live_bitrate = encoder.supports_live_bitrate();
        let (commands, inbox) = flume::unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("encoder-drain".into())
                .spawn(move || drain_loop(encoder, ctx, inbox, stop))
                .map_err(|e| StreamError::EncoderInit(format!("spawn drain thread: {e}")))?
        };

        info!("Hardware encoder running (live bitrate: {})", live_bitrate);
        Ok(Self {
            surface,
            commands,
            stop,
            live_bitrate,
            handle: Some(handle),
        })
    }

    pub fn surface(&self) -> Arc<dyn EncoderSurface> {
        Arc::clone(&self.surface)
    }

    pub fn supports_live_bitrate(&self) -> bool {
        self.live_bitrate
    }

    pub fn send(&self, command: EncoderCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::Encoder("drain loop is gone".into()))
    }

    /// Signal the drain loop and wait for it to stop the encoder.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            error!("Encoder drain thread panicked");
        }
        debug!("Hardware encoder drained");
    }
}

impl Drop for HardwareSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drain_loop(
    mut encoder: Box<dyn HardwareEncoder>,
    ctx: DrainContext,
    inbox: flume::Receiver<EncoderCommand>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        for command in inbox.try_iter() {
            match command {
                EncoderCommand::SetBitrate(bps) => match encoder.set_bitrate(bps) {
                    Ok(()) => info!("Encoder bitrate set to {} bps", bps),
                    Err(e) => warn!("Bitrate change rejected: {}", e),
                },
            }
        }
        if ctx.shared.take_key_frame_request() {
            debug!("Requesting key frame");
            encoder.request_key_frame();
        }

        match encoder.dequeue_output(ctx.poll_timeout) {
            Ok(EncoderOutput::TryAgain) => continue,
            Ok(EncoderOutput::FormatChanged) => debug!("Encoder output format changed"),
            Ok(EncoderOutput::Config(bytes)) => {
                ctx.shared.store_codec_config(bytes);
            }
            Ok(EncoderOutput::AccessUnit {
                data, captured_at, ..
            }) => {
                let timestamp = ctx
                    .shared
                    .timestamp_ms(captured_at.unwrap_or_else(Instant::now));
                ctx.queue.offer(Frame::access_unit(data, timestamp));
            }
            Err(e) => {
                error!("Encoder drain loop terminated: {}", e);
                ctx.events.emit(StreamEvent::EncoderFailed {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }

    encoder.stop();
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::capture::{FrameKind, PlanarImage};

    struct NullSurface;

    impl EncoderSurface for NullSurface {
        fn write_image(&self, _image: PlanarImage) -> Result<()> {
            Ok(())
        }
    }

    /// Plays back a fixed script of outputs, then reports `TryAgain`.
    struct ScriptedEncoder {
        script: VecDeque<Result<EncoderOutput>>,
        bitrates: Arc<Mutex<Vec<u32>>>,
        key_frames: Arc<AtomicBool>,
        stopped: Arc<AtomicBool>,
    }

    impl HardwareEncoder for ScriptedEncoder {
        fn input_surface(&self) -> Arc<dyn EncoderSurface> {
            Arc::new(NullSurface)
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
            match self.script.pop_front() {
                Some(step) => step,
                None => {
                    thread::sleep(timeout);
                    Ok(EncoderOutput::TryAgain)
                }
            }
        }

        fn supports_live_bitrate(&self) -> bool {
            true
        }

        fn set_bitrate(&mut self, bits_per_second: u32) -> Result<()> {
            self.bitrates.lock().unwrap().push(bits_per_second);
            Ok(())
        }

        fn request_key_frame(&mut self) {
            self.key_frames.store(true, Ordering::SeqCst);
        }

        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn context() -> DrainContext {
        DrainContext {
            queue: Arc::new(FrameQueue::new(2)),
            shared: Arc::new(SharedState::new()),
            events: EventBus::new(),
            poll_timeout: Duration::from_millis(5),
        }
    }

    fn unit(byte: u8) -> Result<EncoderOutput> {
        Ok(EncoderOutput::AccessUnit {
            data: Bytes::from(vec![byte]),
            key_frame: true,
            captured_at: None,
        })
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn config_units_are_cached_not_queued() {
        let ctx = context();
        let stopped = Arc::new(AtomicBool::new(false));
        let encoder = ScriptedEncoder {
            script: VecDeque::from(vec![
                Ok(EncoderOutput::TryAgain),
                Ok(EncoderOutput::Config(Bytes::from_static(b"sps-pps"))),
                unit(1),
                unit(2),
            ]),
            bitrates: Arc::default(),
            key_frames: Arc::default(),
            stopped: Arc::clone(&stopped),
        };

        let mut session = HardwareSession::start(Box::new(encoder), ctx.clone()).unwrap();
        assert!(wait_for(|| ctx.queue.stats().offered == 2));

        assert_eq!(&ctx.shared.codec_config().unwrap()[..], &b"sps-pps"[..]);
        let mut kinds = Vec::new();
        while let Some(frame) = ctx.queue.poll(Duration::ZERO) {
            kinds.push((frame.kind, frame.data[0]));
        }
        assert_eq!(
            kinds,
            vec![(FrameKind::AccessUnit, 1), (FrameKind::AccessUnit, 2)]
        );

        session.stop();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn encoder_error_ends_the_loop_and_notifies() {
        let ctx = context();
        let events = ctx.events.subscribe();
        let stopped = Arc::new(AtomicBool::new(false));
        let encoder = ScriptedEncoder {
            script: VecDeque::from(vec![
                unit(1),
                Err(StreamError::Encoder("codec reset".into())),
                unit(2),
            ]),
            bitrates: Arc::default(),
            key_frames: Arc::default(),
            stopped: Arc::clone(&stopped),
        };

        let _session = HardwareSession::start(Box::new(encoder), ctx.clone()).unwrap();
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(5)),
            Ok(StreamEvent::EncoderFailed { .. })
        ));
        assert!(wait_for(|| stopped.load(Ordering::SeqCst)));
        assert_eq!(ctx.queue.stats().offered, 1);
    }

    #[test]
    fn commands_reach_the_encoder() {
        let ctx = context();
        let bitrates = Arc::new(Mutex::new(Vec::new()));
        let encoder = ScriptedEncoder {
            script: VecDeque::new(),
            bitrates: Arc::clone(&bitrates),
            key_frames: Arc::default(),
            stopped: Arc::default(),
        };

        let session = HardwareSession::start(Box::new(encoder), ctx).unwrap();
        assert!(session.supports_live_bitrate());
        session.send(EncoderCommand::SetBitrate(2_000_000)).unwrap();
        assert!(wait_for(|| bitrates.lock().unwrap().as_slice() == [2_000_000]));
    }

    #[test]
    fn key_frame_requests_reach_the_encoder_once() {
        let ctx = context();
        let key_frames = Arc::new(AtomicBool::new(false));
        let encoder = ScriptedEncoder {
            script: VecDeque::new(),
            bitrates: Arc::default(),
            key_frames: Arc::clone(&key_frames),
            stopped: Arc::default(),
        };

        let _session = HardwareSession::start(Box::new(encoder), ctx.clone()).unwrap();
        ctx.shared.request_key_frame();
        assert!(wait_for(|| key_frames.load(Ordering::SeqCst)));
        assert!(!ctx.shared.take_key_frame_request());
    }
}
