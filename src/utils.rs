//! Camera discovery through GStreamer's device monitor, with a direct open
//! check for backends it misses. On Linux, nodes can also be queried via V4L2.

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::capture::{select, Platform, SourceDescriptor};
use crate::environment::EnvironmentContext;
use crate::errors::{CaptureError, CaptureResult};
use crate::runtime;

/// Device properties that carry a node path, by provider
const PATH_KEYS: [&str; 3] = ["api.v4l2.path", "device.path", "object.path"];

/// Camera found by the device monitor
#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    /// Position in enumeration order, usable as a camera index
    pub index: u32,
    pub name: String,
    pub device_class: String,
    pub path: Option<String>,
    pub modes: Vec<CameraMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct CameraMode {
    pub width: u32,
    pub height: u32,
    /// Highest advertised rate, rounded
    pub fps: u32,
}

/// List video sources through GStreamer's device monitor
pub fn list_cameras(env: &EnvironmentContext) -> CaptureResult<Vec<CameraInfo>> {
    runtime::init(env)?;
    info!("Enumerating cameras...");

    let monitor = gst::DeviceMonitor::new();
    monitor.add_filter(Some("Video/Source"), None);
    monitor
        .start()
        .map_err(|e| CaptureError::Runtime(format!("device monitor failed to start: {e}")))?;

    let cameras = monitor
        .devices()
        .into_iter()
        .filter(|device| device.device_class().contains("Video/Source"))
        .enumerate()
        .map(|(index, device)| {
            let path = device.properties().and_then(|props| {
                PATH_KEYS
                    .iter()
                    .find_map(|key| props.get::<String>(*key).ok())
            });
            let modes = device
                .caps()
                .map(|caps| modes_from_caps(&caps))
                .unwrap_or_default();

            debug!("Found {} ({} modes)", device.display_name(), modes.len());
            CameraInfo {
                index: index as u32,
                name: device.display_name().to_string(),
                device_class: device.device_class().to_string(),
                path,
                modes,
            }
        })
        .collect();

    monitor.stop();
    Ok(cameras)
}

/// Fixed-size modes in `caps`, largest first. Ranged sizes are skipped.
pub fn modes_from_caps(caps: &gst::CapsRef) -> Vec<CameraMode> {
    let mut modes: Vec<CameraMode> = caps
        .iter()
        .filter_map(|s| {
            let width = s.get::<i32>("width").ok()?;
            let height = s.get::<i32>("height").ok()?;
            let fps = s.value("framerate").ok().and_then(|v| max_rate(v)).unwrap_or(0);
            Some(CameraMode {
                width: width.max(0) as u32,
                height: height.max(0) as u32,
                fps,
            })
        })
        .collect();

    modes.sort_unstable_by(|a, b| b.cmp(a));
    modes.dedup();
    modes
}

fn max_rate(value: &glib::Value) -> Option<u32> {
    if let Ok(rate) = value.get::<gst::Fraction>() {
        return fraction_rate(rate);
    }
    if let Ok(list) = value.get::<gst::List>() {
        return list
            .iter()
            .filter_map(|v| v.get::<gst::Fraction>().ok())
            .filter_map(fraction_rate)
            .max();
    }
    if let Ok(range) = value.get::<gst::FractionRange>() {
        return fraction_rate(range.max());
    }
    None
}

fn fraction_rate(rate: gst::Fraction) -> Option<u32> {
    let (numer, denom) = (rate.numer(), rate.denom());
    if numer <= 0 || denom <= 0 {
        return None;
    }
    Some(((numer + denom / 2) / denom) as u32)
}

/// Check that `source` opens: `<source> ! fakesink` must reach READY.
pub fn try_open(env: &EnvironmentContext, source: &SourceDescriptor) -> CaptureResult<()> {
    runtime::init(env)?;

    let device = source.device_label();
    let pipeline = gst::parse::launch(&format!("{source} ! fakesink"))
        .map_err(|e| CaptureError::PipelineConstruction(e.to_string()))?;

    let result = match pipeline.set_state(gst::State::Ready) {
        Ok(_) => Ok(()),
        Err(_) => {
            let reason = pipeline
                .bus()
                .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]))
                .and_then(|msg| match msg.view() {
                    gst::MessageView::Error(err) => Some(err.error().message().to_string()),
                    _ => None,
                })
                .unwrap_or_else(|| "source failed to open".into());
            Err(CaptureError::DeviceUnavailable {
                device: device.clone(),
                reason,
            })
        }
    };

    let _ = pipeline.set_state(gst::State::Null);
    debug!("Opened {}: {}", device, if result.is_ok() { "ok" } else { "unavailable" });
    result
}

/// Camera indices below `limit` whose preferred backend opens.
///
/// Used when the device monitor has no provider for the platform's backend.
pub fn openable_indices(
    env: &EnvironmentContext,
    platform: Platform,
    limit: u32,
) -> Vec<(u32, SourceDescriptor)> {
    (0..limit)
        .map(|index| (index, select(index, platform)))
        .filter(|(_, source)| try_open(env, source).is_ok())
        .collect()
}

/// V4L2 node as reported by the kernel driver
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Serialize)]
pub struct V4lNode {
    pub card: String,
    pub driver: String,
    pub can_capture: bool,
    /// FourCC codes, in driver order
    pub formats: Vec<String>,
}

/// Query a V4L2 node directly, bypassing GStreamer
#[cfg(target_os = "linux")]
pub fn v4l_formats(path: &std::path::Path) -> CaptureResult<V4lNode> {
    use v4l::{capability::Flags, video::Capture, Device};

    let unavailable = |e: std::io::Error| CaptureError::DeviceUnavailable {
        device: path.display().to_string(),
        reason: e.to_string(),
    };

    let dev = Device::with_path(path).map_err(unavailable)?;
    let caps = dev.query_caps().map_err(unavailable)?;
    let formats = dev
        .enum_formats()
        .map_err(unavailable)?
        .into_iter()
        .map(|fmt| fmt.fourcc.to_string())
        .collect();

    Ok(V4lNode {
        card: caps.card,
        driver: caps.driver,
        can_capture: caps.capabilities.contains(Flags::VIDEO_CAPTURE),
        formats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn caps(description: &str) -> Option<gst::Caps> {
        gst::init().ok()?;
        gst::Caps::from_str(description).ok()
    }

    #[test]
    fn modes_are_sorted_and_deduplicated() {
        let Some(caps) = caps(
            "video/x-raw, width=640, height=480, framerate=30/1; \
             image/jpeg, width=1280, height=720, framerate={ 15/1, 30/1 }; \
             video/x-raw, width=640, height=480, framerate=30/1",
        ) else {
            return;
        };

        let modes = modes_from_caps(&caps);
        assert_eq!(
            modes,
            vec![
                CameraMode { width: 1280, height: 720, fps: 30 },
                CameraMode { width: 640, height: 480, fps: 30 },
            ]
        );
    }

    #[test]
    fn fractional_and_ranged_rates() {
        let Some(caps) = caps(
            "video/x-raw, width=320, height=240, framerate=30000/1001; \
             video/x-raw, width=160, height=120, framerate=[ 1/1, 60/1 ]",
        ) else {
            return;
        };

        let modes = modes_from_caps(&caps);
        assert_eq!(modes[0], CameraMode { width: 320, height: 240, fps: 30 });
        assert_eq!(modes[1], CameraMode { width: 160, height: 120, fps: 60 });
    }

    #[test]
    fn ranged_sizes_are_skipped() {
        let Some(caps) = caps("video/x-raw, width=[ 1, 4096 ], height=[ 1, 2160 ]") else {
            return;
        };
        assert!(modes_from_caps(&caps).is_empty());
    }
}
