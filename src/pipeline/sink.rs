//! appsink callback: copies each decoded sample into an owned `Frame`

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, trace};

use super::slot::FrameSlot;
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::errors::{CaptureError, CaptureResult};

/// Log one decode fault out of this many
const FAULT_LOG_INTERVAL: u64 = 30;

/// Terminal stage handing frames to the session's slot
pub struct FrameSink {
    slot: Arc<FrameSlot>,
    active: Arc<AtomicBool>,
    /// Required output layout; `None` accepts any supported packed format
    expected: Option<PixelFormat>,
    sequence: AtomicU64,
}

impl FrameSink {
    pub fn new(
        slot: Arc<FrameSlot>,
        active: Arc<AtomicBool>,
        expected: Option<PixelFormat>,
    ) -> Self {
        Self {
            slot,
            active,
            expected,
            sequence: AtomicU64::new(0),
        }
    }

    /// Route `appsink`'s new-sample callback into this sink.
    pub fn attach(self, appsink: &gst_app::AppSink) {
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let sink = Arc::new(self);
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    sink.on_sample(&sample);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );
    }

    /// Detach all callbacks so the closure (and its slot handle) is released.
    pub fn detach(appsink: &gst_app::AppSink) {
        appsink.set_callbacks(gst_app::AppSinkCallbacks::builder().build());
    }

    /// Handle one sample. Faults are counted and swallowed so the pipeline keeps flowing.
    pub fn on_sample(&self, sample: &gst::Sample) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }

        match self.decode(sample) {
            Ok(frame) => {
                trace!(sequence = frame.sequence(), "Publishing frame");
                self.slot.publish(frame);
            }
            Err(e) => {
                self.slot.record_decode_fault();
                let faults = self.slot.stats().decode_faults;
                if faults % FAULT_LOG_INTERVAL == 1 {
                    debug!(faults, error = %e, "Skipping frame");
                }
            }
        }
    }

    fn decode(&self, sample: &gst::Sample) -> CaptureResult<Frame> {
        let captured_at = Instant::now();

        let buffer = sample
            .buffer()
            .ok_or_else(|| CaptureError::DecodeFault("sample contains no buffer".into()))?;
        if buffer.flags().contains(gst::BufferFlags::CORRUPTED) {
            return Err(CaptureError::DecodeFault("buffer marked corrupted".into()));
        }

        let caps = sample
            .caps()
            .ok_or_else(|| CaptureError::DecodeFault("sample has no caps".into()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|_| CaptureError::DecodeFault("caps are not raw video".into()))?;

        let format = match info.format() {
            gst_video::VideoFormat::Bgr => PixelFormat::Bgr24,
            gst_video::VideoFormat::Rgb => PixelFormat::Rgb24,
            gst_video::VideoFormat::Gray8 => PixelFormat::Gray8,
            other => {
                return Err(CaptureError::DecodeFault(format!(
                    "unexpected format {other:?}"
                )))
            }
        };
        if let Some(expected) = self.expected.filter(|&e| e != format) {
            return Err(CaptureError::DecodeFault(format!(
                "negotiated {format:?}, expected {expected:?}"
            )));
        }

        let map = buffer
            .map_readable()
            .map_err(|_| CaptureError::DecodeFault("failed to map buffer".into()))?;

        // Copy out now: the buffer is recycled once this callback returns
        let stride = info.stride()[0].max(0) as usize;
        let data = pack_rows(map.as_slice(), info.width(), info.height(), stride, format)?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let meta = FrameMetadata {
            sequence,
            width: info.width(),
            height: info.height(),
            format,
            captured_at,
            device_timestamp: buffer.pts().map(|pts| pts.into()),
        };
        Frame::new(meta, data)
    }
}

/// Copy `height` rows of `width` pixels out of a strided buffer into a packed one.
pub fn pack_rows(
    src: &[u8],
    width: u32,
    height: u32,
    stride: usize,
    format: PixelFormat,
) -> CaptureResult<Bytes> {
    let row = format.frame_size(width, 1);
    let rows = height as usize;
    if stride < row {
        return Err(CaptureError::DecodeFault(format!(
            "stride {stride} shorter than row of {row} bytes"
        )));
    }
    let needed = if rows == 0 { 0 } else { stride * (rows - 1) + row };
    if src.len() < needed {
        return Err(CaptureError::DecodeFault(format!(
            "buffer holds {} bytes, {}x{} needs {}",
            src.len(),
            width,
            height,
            needed
        )));
    }

    if stride == row {
        return Ok(Bytes::copy_from_slice(&src[..row * rows]));
    }

    let mut packed = BytesMut::with_capacity(row * rows);
    for y in 0..rows {
        let start = y * stride;
        packed.extend_from_slice(&src[start..start + row]);
    }
    Ok(packed.freeze())
}
