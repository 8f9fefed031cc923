//! Error taxonomy for the capture core

use std::path::PathBuf;

use gstreamer as gst;
use gstreamer::glib;
use thiserror::Error;

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// Neither a bundled nor a system GStreamer runtime could be located.
    #[error("GStreamer runtime not found (searched: {})", display_paths(.searched))]
    RuntimeNotFound { searched: Vec<PathBuf> },

    /// The selected camera does not exist or is held by another process.
    #[error("camera {device} unavailable: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    /// A stage rejected the negotiated format or could not be created.
    #[error("pipeline construction failed: {0}")]
    PipelineConstruction(String),

    /// A single frame could not be turned into a valid `Frame`.
    ///
    /// Only raised inside the frame sink, where it is counted and dropped. A
    /// decoder error posted on the bus stops the stream and maps to `Runtime`.
    #[error("frame decode fault: {0}")]
    DecodeFault(String),

    #[error("capture session already released")]
    SessionClosed,

    #[error("GStreamer runtime error: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl CaptureError {
    /// Only a missing or busy device is worth retrying (e.g. after refreshing the device list).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::DeviceUnavailable { .. })
    }

    /// Map an error posted on the pipeline bus onto the taxonomy.
    pub fn from_bus_error(err: &glib::Error, debug: Option<&str>, device: &str) -> Self {
        let detail = match debug {
            Some(debug) => format!("{} ({})", err.message(), debug),
            None => err.message().to_string(),
        };

        if let Some(kind) = err.kind::<gst::ResourceError>() {
            return match kind {
                gst::ResourceError::NotFound
                | gst::ResourceError::OpenRead
                | gst::ResourceError::OpenReadWrite
                | gst::ResourceError::OpenWrite
                | gst::ResourceError::Busy
                | gst::ResourceError::Read => CaptureError::DeviceUnavailable {
                    device: device.to_string(),
                    reason: detail,
                },
                gst::ResourceError::Settings => CaptureError::PipelineConstruction(detail),
                _ => CaptureError::Runtime(detail),
            };
        }

        if let Some(kind) = err.kind::<gst::StreamError>() {
            return match kind {
                gst::StreamError::Format
                | gst::StreamError::WrongType
                | gst::StreamError::CodecNotFound => CaptureError::PipelineConstruction(detail),
                // Streaming threads report failed caps negotiation as a generic flow error
                gst::StreamError::Failed
                    if debug.is_some_and(|d| d.contains("not-negotiated")) =>
                {
                    CaptureError::PipelineConstruction(detail)
                }
                _ => CaptureError::Runtime(detail),
            };
        }

        if let Some(kind) = err.kind::<gst::CoreError>() {
            return match kind {
                gst::CoreError::Negotiation | gst::CoreError::MissingPlugin => {
                    CaptureError::PipelineConstruction(detail)
                }
                _ => CaptureError::Runtime(detail),
            };
        }

        CaptureError::Runtime(detail)
    }
}

impl From<glib::BoolError> for CaptureError {
    fn from(err: glib::BoolError) -> Self {
        CaptureError::PipelineConstruction(err.to_string())
    }
}

impl From<config::ConfigError> for CaptureError {
    fn from(err: config::ConfigError) -> Self {
        CaptureError::Config(err.to_string())
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_errors_are_device_unavailable() {
        let err = glib::Error::new(gst::ResourceError::NotFound, "Cannot identify device");
        let mapped = CaptureError::from_bus_error(&err, None, "/dev/video99");
        assert!(matches!(mapped, CaptureError::DeviceUnavailable { .. }));
        assert!(mapped.is_retryable());

        let busy = glib::Error::new(gst::ResourceError::Busy, "Device is busy");
        assert!(CaptureError::from_bus_error(&busy, Some("v4l2src0"), "0").is_retryable());
    }

    #[test]
    fn negotiation_errors_are_construction_errors() {
        let err = glib::Error::new(gst::CoreError::Negotiation, "not negotiated");
        let mapped = CaptureError::from_bus_error(&err, Some("caps mismatch"), "0");
        match mapped {
            CaptureError::PipelineConstruction(msg) => assert!(msg.contains("caps mismatch")),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }

    #[test]
    fn unnegotiated_flow_is_a_construction_error() {
        let err = glib::Error::new(gst::StreamError::Failed, "Internal data stream error.");
        let debug = "streaming stopped, reason not-negotiated (-4)";
        assert!(matches!(
            CaptureError::from_bus_error(&err, Some(debug), "cam"),
            CaptureError::PipelineConstruction(_)
        ));
        assert!(matches!(
            CaptureError::from_bus_error(&err, None, "cam"),
            CaptureError::Runtime(_)
        ));
    }

    #[test]
    fn bus_decode_errors_stop_the_stream() {
        for err in [
            glib::Error::new(gst::StreamError::Decode, "Could not decode stream."),
            glib::Error::new(gst::StreamError::Demux, "Could not demultiplex stream."),
        ] {
            let mapped = CaptureError::from_bus_error(&err, Some("jpegdec0"), "cam");
            assert!(matches!(mapped, CaptureError::Runtime(_)), "{mapped:?}");
            assert!(!mapped.is_retryable());
        }
    }

    #[test]
    fn runtime_not_found_lists_searched_paths() {
        let err = CaptureError::RuntimeNotFound {
            searched: vec![PathBuf::from("/a/gstreamer"), PathBuf::from("/usr/lib")],
        };
        let text = err.to_string();
        assert!(text.contains("/a/gstreamer"));
        assert!(text.contains("/usr/lib"));
        assert!(!err.is_retryable());
    }
}
