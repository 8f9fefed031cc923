use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{CaptureError, CaptureResult};

/// Decoded raster frame, immutable once built.
///
/// The payload is a shared `Bytes` handle: clones are cheap and nothing can
/// write through them, so a frame handed to a consumer never aliases mutable
/// pipeline memory.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Bytes,
    meta: Arc<FrameMetadata>,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Wall-clock instant the sink received the buffer
    pub captured_at: Instant,
    pub device_timestamp: Option<Duration>, // Buffer PTS if the source set one
}

/// Packed output formats a session can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
    Gray8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }

    /// Name of the format in GStreamer caps.
    pub fn caps_name(self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "BGR",
            PixelFormat::Rgb24 => "RGB",
            PixelFormat::Gray8 => "GRAY8",
        }
    }

    /// Exact payload size of a packed `width`x`height` frame.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.channels()
    }
}

impl Frame {
    /// Build a frame, rejecting payloads whose length disagrees with the metadata.
    pub fn new(meta: FrameMetadata, data: Bytes) -> CaptureResult<Self> {
        let expected = meta.format.frame_size(meta.width, meta.height);
        if data.len() != expected {
            return Err(CaptureError::DecodeFault(format!(
                "payload is {} bytes, {}x{} {:?} needs {}",
                data.len(),
                meta.width,
                meta.height,
                meta.format,
                expected
            )));
        }

        Ok(Self {
            data,
            meta: Arc::new(meta),
        })
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.meta.captured_at
    }

    pub fn meta(&self) -> &FrameMetadata {
        &self.meta
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the payload.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Owned, mutable copy of the payload.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// Convert to an RGB image for export, swapping channels or expanding gray as needed.
    pub fn to_rgb_image(&self) -> image::RgbImage {
        let rgb: Vec<u8> = match self.meta.format {
            PixelFormat::Rgb24 => self.data.to_vec(),
            PixelFormat::Bgr24 => self
                .data
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Gray8 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
        };

        // Length is guaranteed by Frame::new
        image::RgbImage::from_raw(self.meta.width, self.meta.height, rgb)
            .unwrap_or_else(|| image::RgbImage::new(self.meta.width, self.meta.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: u32, height: u32, format: PixelFormat) -> FrameMetadata {
        FrameMetadata {
            sequence: 1,
            width,
            height,
            format,
            captured_at: Instant::now(),
            device_timestamp: None,
        }
    }

    #[test]
    fn frame_requires_exact_payload() {
        let ok = Frame::new(meta(4, 2, PixelFormat::Bgr24), Bytes::from(vec![0u8; 24]));
        assert!(ok.is_ok());

        let short = Frame::new(meta(4, 2, PixelFormat::Bgr24), Bytes::from(vec![0u8; 23]));
        assert!(matches!(short, Err(CaptureError::DecodeFault(_))));

        let gray = Frame::new(meta(4, 2, PixelFormat::Gray8), Bytes::from(vec![0u8; 8]));
        assert_eq!(gray.map(|f| f.data().len()).ok(), Some(8));
    }

    #[test]
    fn empty_frame_is_valid() {
        let frame = Frame::new(meta(0, 0, PixelFormat::Rgb24), Bytes::new()).unwrap();
        assert_eq!(frame.width(), 0);
        assert!(frame.data().is_empty());
    }

    #[test]
    fn bgr_frames_export_as_rgb() {
        let frame = Frame::new(
            meta(2, 1, PixelFormat::Bgr24),
            Bytes::from(vec![1, 2, 3, 4, 5, 6]),
        )
        .unwrap();
        let img = frame.to_rgb_image();
        assert_eq!(img.get_pixel(0, 0).0, [3, 2, 1]);
        assert_eq!(img.get_pixel(1, 0).0, [6, 5, 4]);
    }

    #[test]
    fn copies_do_not_alias_the_payload() {
        let frame = Frame::new(meta(1, 1, PixelFormat::Rgb24), Bytes::from(vec![9, 9, 9])).unwrap();
        let mut copy = frame.to_vec();
        copy[0] = 0;
        assert_eq!(frame.data(), &[9, 9, 9]);
    }
}
