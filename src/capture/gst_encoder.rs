//! GStreamer H.264 encoder behind the surface path
//!
//! `appsrc ! videoconvert ! <encoder> ! h264parse ! appsink`, with the best
//! available encoder element. Parameter sets are split out of the byte
//! stream and reported separately from access units.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::provider::{EncoderOutput, EncoderSurface, HardwareEncoder};
use crate::capture::PlanarImage;
use crate::encode::convert::planar_to_i420;
use crate::encode::EncoderConfig;
use crate::error::{Result, StreamError};

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// Encoder element plus how it spells its rate and GOP properties.
#[derive(Debug, Clone, Copy)]
struct EncoderElement {
    name: &'static str,
    /// Bitrate property, in kbit/s
    bitrate: Option<&'static str>,
    gop: Option<&'static str>,
    extra: &'static str,
}

const ENCODERS: [EncoderElement; 4] = [
    EncoderElement {
        name: "nvh264enc",
        bitrate: Some("bitrate"),
        gop: Some("gop-size"),
        extra: "preset=low-latency-hq zerolatency=true",
    },
    EncoderElement {
        name: "vaapih264enc",
        bitrate: Some("bitrate"),
        gop: Some("keyframe-period"),
        extra: "",
    },
    EncoderElement {
        name: "v4l2h264enc",
        bitrate: None,
        gop: None,
        extra: "",
    },
    EncoderElement {
        name: "x264enc",
        bitrate: Some("bitrate"),
        gop: Some("key-int-max"),
        extra: "tune=zerolatency speed-preset=ultrafast",
    },
];

/// Best available encoder (hardware > software)
fn detect_encoder() -> Option<EncoderElement> {
    for encoder in ENCODERS {
        if let Some(factory) = gst::ElementFactory::find(encoder.name) {
            debug!(
                "Found encoder: {} - {}",
                encoder.name,
                factory.metadata("long-name").unwrap_or("")
            );
            return Some(encoder);
        }
    }
    None
}

fn init_error(what: impl std::fmt::Display) -> StreamError {
    StreamError::EncoderInit(what.to_string())
}

pub struct GstEncoder {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    element: EncoderElement,
    surface: Arc<GstSurface>,
    pending: VecDeque<EncoderOutput>,
    last_config: Option<Bytes>,
}

impl GstEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        gst::init().map_err(|e| init_error(format!("GStreamer init: {e}")))?;
        let element = detect_encoder().ok_or_else(|| init_error("no H.264 encoder element"))?;
        info!("Using encoder: {}", element.name);

        let description = format!(
            "appsrc name=src is-live=true format=time \
               caps=video/x-raw,format=I420,width={w},height={h},framerate={fps}/1 ! \
             queue max-size-buffers=2 max-size-time=0 max-size-bytes=0 leaky=downstream ! \
             videoconvert ! \
             {enc} name=enc {extra} ! \
             h264parse config-interval=-1 ! \
             video/x-h264,stream-format=byte-stream,alignment=au ! \
             appsink name=sink",
            w = config.width,
            h = config.height,
            fps = config.target_fps.max(1),
            enc = element.name,
            extra = element.extra,
        );
        debug!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(init_error)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| init_error("not a pipeline"))?;

        let appsrc = pipeline
            .by_name("src")
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .ok_or_else(|| init_error("missing appsrc"))?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .ok_or_else(|| init_error("missing appsink"))?;
        let encoder = pipeline
            .by_name("enc")
            .ok_or_else(|| init_error("missing encoder element"))?;

        appsink.set_property("max-buffers", 4u32);
        appsink.set_property("drop", false);
        appsink.set_property("sync", false);

        let mut this = Self {
            pipeline,
            appsink,
            encoder,
            element,
            surface: Arc::new(GstSurface {
                appsrc,
                width: config.width,
                height: config.height,
                epoch: Instant::now(),
            }),
            pending: VecDeque::new(),
            last_config: None,
        };
        if element.bitrate.is_some() {
            this.apply_bitrate(config.effective_bitrate())?;
        }
        if let Some(gop) = element.gop {
            let frames = config.target_fps.max(1) * config.key_frame_interval_secs.max(1);
            this.encoder.set_property_from_str(gop, &frames.to_string());
        }
        Ok(this)
    }

    fn apply_bitrate(&mut self, bits_per_second: u32) -> Result<()> {
        let Some(property) = self.element.bitrate else {
            return Err(StreamError::Unsupported(format!(
                "bitrate on {}",
                self.element.name
            )));
        };
        let kbps = (bits_per_second / 1000).max(1);
        self.encoder.set_property_from_str(property, &kbps.to_string());
        Ok(())
    }

    /// Split one byte-stream access unit into parameter sets and the rest.
    fn split_access_unit(data: &[u8]) -> (Bytes, Bytes) {
        let mut config = BytesMut::new();
        let mut rest = BytesMut::new();
        for nal in nal_units(data) {
            let kind = nal.get(start_code_len(nal)).map_or(0, |b| b & 0x1f);
            if kind == NAL_SPS || kind == NAL_PPS {
                config.extend_from_slice(nal);
            } else {
                rest.extend_from_slice(nal);
            }
        }
        (config.freeze(), rest.freeze())
    }

    fn bus_error(&self) -> Option<StreamError> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;
        Some(match msg.view() {
            gst::MessageView::Error(err) => StreamError::Encoder(format!(
                "{} ({:?})",
                err.error(),
                err.debug()
            )),
            _ => StreamError::Encoder("encoder pipeline reached end of stream".into()),
        })
    }
}

impl HardwareEncoder for GstEncoder {
    fn input_surface(&self) -> Arc<dyn EncoderSurface> {
        Arc::clone(&self.surface) as Arc<dyn EncoderSurface>
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| init_error(format!("failed to start pipeline: {e:?}")))?;
        Ok(())
    }

    fn dequeue_output(&mut self, timeout: Duration) -> Result<EncoderOutput> {
        if let Some(output) = self.pending.pop_front() {
            return Ok(output);
        }
        if let Some(err) = self.bus_error() {
            return Err(err);
        }

        let Some(sample) = self
            .appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(timeout.as_millis() as u64))
        else {
            return Ok(EncoderOutput::TryAgain);
        };
        let buffer = sample
            .buffer()
            .ok_or_else(|| StreamError::Encoder("sample contains no buffer".into()))?;
        let map = buffer
            .map_readable()
            .map_err(|_| StreamError::Encoder("failed to map buffer".into()))?;
        let key_frame = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);

        let (config, unit) = Self::split_access_unit(map.as_slice());
        if !config.is_empty() && self.last_config.as_ref() != Some(&config) {
            self.last_config = Some(config.clone());
            self.pending.push_back(EncoderOutput::Config(config));
        }
        if !unit.is_empty() {
            self.pending.push_back(EncoderOutput::AccessUnit {
                data: unit,
                key_frame,
                captured_at: Some(Instant::now()),
            });
        }
        Ok(self.pending.pop_front().unwrap_or(EncoderOutput::TryAgain))
    }

    fn supports_live_bitrate(&self) -> bool {
        self.element.bitrate.is_some()
    }

    fn set_bitrate(&mut self, bits_per_second: u32) -> Result<()> {
        self.apply_bitrate(bits_per_second)
    }

    fn request_key_frame(&mut self) {
        let event = gst_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.appsink.send_event(event) {
            debug!("Key frame request not handled");
        }
    }

    fn stop(&mut self) {
        let _ = self.surface.appsrc.end_of_stream();
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop encoder pipeline: {:?}", e);
        }
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Writable input of the pipeline; cameras push I420 frames into it.
struct GstSurface {
    appsrc: gst_app::AppSrc,
    width: u32,
    height: u32,
    epoch: Instant,
}

impl EncoderSurface for GstSurface {
    fn write_image(&self, image: PlanarImage) -> Result<()> {
        if (image.width, image.height) != (self.width, self.height) {
            return Err(StreamError::FrameProcessing(format!(
                "surface expects {}x{}, got {}x{}",
                self.width, self.height, image.width, image.height
            )));
        }
        let pts = image.captured_at.saturating_duration_since(self.epoch);
        let mut buffer = gst::Buffer::from_mut_slice(planar_to_i420(&image)?);
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gst::ClockTime::from_nseconds(pts.as_nanos() as u64));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| StreamError::Encoder(format!("appsrc rejected buffer: {e:?}")))?;
        Ok(())
    }
}

fn start_code_len(nal: &[u8]) -> usize {
    if nal.starts_with(&[0, 0, 0, 1]) {
        4
    } else if nal.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    }
}

/// NAL units of an Annex B byte stream, each including its start code.
fn nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push(start);
            i += 3;
        } else {
            i += 1;
        }
    }
    if starts.is_empty() {
        return if data.is_empty() { Vec::new() } else { vec![data] };
    }

    let mut units = Vec::with_capacity(starts.len());
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(data.len());
        units.push(&data[start..end]);
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_sets_are_split_from_slices() {
        let au = [
            0, 0, 0, 1, 0x67, 0x42, 0x00, // SPS
            0, 0, 0, 1, 0x68, 0xce, // PPS
            0, 0, 1, 0x65, 0x88, 0x84, // IDR slice
        ];
        let (config, unit) = GstEncoder::split_access_unit(&au);
        assert_eq!(&config[..], &au[..13]);
        assert_eq!(&unit[..], &au[13..]);
    }

    #[test]
    fn delta_unit_without_headers_has_no_config() {
        let au = [0, 0, 0, 1, 0x41, 0x9a, 0x00];
        let (config, unit) = GstEncoder::split_access_unit(&au);
        assert!(config.is_empty());
        assert_eq!(&unit[..], &au[..]);
    }
}
