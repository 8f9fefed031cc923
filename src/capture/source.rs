//! Camera index to capture backend translation.
//!
//! Pure mapping: no device is opened here. An index that names no device is
//! only discovered when the pipeline goes to READY.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Operating systems with a known camera backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

/// A typed property value for an element.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i32),
    UInt(u32),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::UInt(v) => write!(f, "{v}"),
            ParamValue::Str(v) => write!(f, "{v}"),
        }
    }
}

/// One camera backend, addressed the way that backend expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    /// DirectShow (`dshowvideosrc`), Windows
    DirectShow { device_index: u32 },
    /// Kernel Streaming (`ksvideosrc`), Windows
    KernelStreaming { device_index: u32 },
    /// Media Foundation (`mfvideosrc`), Windows 10+
    MediaFoundation { device_index: u32 },
    /// Video4Linux2 (`v4l2src`), addressed by device node
    V4l2 { device: PathBuf },
    /// AVFoundation (`avfvideosrc`), macOS
    AvFoundation { device_index: u32 },
    /// Synthetic live source with a fixed native mode
    TestPattern {
        pattern: String,
        width: u32,
        height: u32,
        framerate: u32,
    },
}

/// Canonical backend for `camera_index` on `platform`.
pub fn select(camera_index: u32, platform: Platform) -> SourceDescriptor {
    match platform {
        Platform::Windows => SourceDescriptor::DirectShow {
            device_index: camera_index,
        },
        Platform::Linux => SourceDescriptor::V4l2 {
            device: PathBuf::from(format!("/dev/video{camera_index}")),
        },
        Platform::MacOs => SourceDescriptor::AvFoundation {
            device_index: camera_index,
        },
    }
}

/// Canonical backend first, then the fallbacks worth trying when its element is missing.
pub fn alternatives(camera_index: u32, platform: Platform) -> Vec<SourceDescriptor> {
    let mut sources = vec![select(camera_index, platform)];
    if platform == Platform::Windows {
        sources.push(SourceDescriptor::KernelStreaming {
            device_index: camera_index,
        });
        sources.push(SourceDescriptor::MediaFoundation {
            device_index: camera_index,
        });
    }
    sources
}

impl SourceDescriptor {
    /// Element factory implementing this backend
    pub fn element(&self) -> &'static str {
        match self {
            SourceDescriptor::DirectShow { .. } => "dshowvideosrc",
            SourceDescriptor::KernelStreaming { .. } => "ksvideosrc",
            SourceDescriptor::MediaFoundation { .. } => "mfvideosrc",
            SourceDescriptor::V4l2 { .. } => "v4l2src",
            SourceDescriptor::AvFoundation { .. } => "avfvideosrc",
            SourceDescriptor::TestPattern { .. } => "videotestsrc",
        }
    }

    /// Ordered device-addressing properties.
    pub fn params(&self) -> Vec<(&'static str, ParamValue)> {
        match self {
            SourceDescriptor::DirectShow { device_index }
            | SourceDescriptor::KernelStreaming { device_index }
            | SourceDescriptor::MediaFoundation { device_index }
            | SourceDescriptor::AvFoundation { device_index } => {
                vec![("device-index", ParamValue::UInt(*device_index))]
            }
            SourceDescriptor::V4l2 { device } => {
                vec![("device", ParamValue::Str(device.display().to_string()))]
            }
            SourceDescriptor::TestPattern { pattern, .. } => vec![
                ("is-live", ParamValue::Bool(true)),
                ("pattern", ParamValue::Str(pattern.clone())),
            ],
        }
    }

    /// Caps the source is pinned to, if any.
    ///
    /// Cameras negotiate their own mode; only the synthetic source is forced
    /// into a fixed resolution and rate.
    pub fn native_mode(&self) -> Option<(u32, u32, u32)> {
        match self {
            SourceDescriptor::TestPattern {
                width,
                height,
                framerate,
                ..
            } => Some((*width, *height, *framerate)),
            _ => None,
        }
    }

    /// Human-readable device address for errors and logs
    pub fn device_label(&self) -> String {
        match self {
            SourceDescriptor::V4l2 { device } => device.display().to_string(),
            SourceDescriptor::TestPattern { pattern, .. } => format!("test:{pattern}"),
            SourceDescriptor::DirectShow { device_index }
            | SourceDescriptor::KernelStreaming { device_index }
            | SourceDescriptor::MediaFoundation { device_index }
            | SourceDescriptor::AvFoundation { device_index } => {
                format!("{}[{}]", self.element(), device_index)
            }
        }
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.element())?;
        for (name, value) in self.params() {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_is_path_addressed() {
        let src = select(2, Platform::Linux);
        assert_eq!(src.element(), "v4l2src");
        assert_eq!(
            src.params(),
            vec![("device", ParamValue::Str("/dev/video2".into()))]
        );
    }

    #[test]
    fn windows_and_macos_are_index_addressed() {
        let win = select(1, Platform::Windows);
        assert_eq!(win.element(), "dshowvideosrc");
        assert_eq!(win.params(), vec![("device-index", ParamValue::UInt(1))]);

        let mac = select(0, Platform::MacOs);
        assert_eq!(mac.element(), "avfvideosrc");
        assert_eq!(mac.to_string(), "avfvideosrc device-index=0");
    }

    #[test]
    fn out_of_range_index_is_not_validated() {
        let src = select(99, Platform::Linux);
        assert_eq!(src.device_label(), "/dev/video99");
    }

    #[test]
    fn windows_fallbacks_follow_preference_order() {
        let names: Vec<_> = alternatives(0, Platform::Windows)
            .iter()
            .map(|s| s.element())
            .collect();
        assert_eq!(names, ["dshowvideosrc", "ksvideosrc", "mfvideosrc"]);
        assert_eq!(alternatives(0, Platform::Linux).len(), 1);
    }

    #[test]
    fn only_test_pattern_has_native_mode() {
        let test = SourceDescriptor::TestPattern {
            pattern: "smpte".into(),
            width: 320,
            height: 240,
            framerate: 30,
        };
        assert_eq!(test.native_mode(), Some((320, 240, 30)));
        assert_eq!(select(0, Platform::Linux).native_mode(), None);
    }
}
