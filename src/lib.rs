pub mod capture;
pub mod environment;
pub mod errors;
pub mod pipeline;
pub mod runtime;
pub mod utils;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use capture::{CaptureRequest, CaptureSession, Frame, FrameMetadata, PixelFormat, SessionState};
pub use environment::{EnvironmentContext, RuntimeMode};
pub use errors::{CaptureError, CaptureResult};
pub use pipeline::{GpuBackend, InputFormat, SlotStats};

/// Prefix of environment variable overrides, e.g. `CAMTAP__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "CAMTAP";

pub(crate) const DEFAULT_START_TIMEOUT_MS: u64 = 3000;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub camera_index: u32,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub use_gpu: bool,
    /// What to request from the device before decoding
    pub input: InputFormat,
    pub format: PixelFormat,
    /// Replaces the generated pipeline; must end in `appsink name=sink`
    pub custom_pipeline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gpu_backend: GpuBackend,
    /// Upper bound on how long `start()` waits for the first frame
    pub start_timeout_ms: u64,
}

/// Where to look for the GStreamer runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory next to the executable holding a bundled runtime
    pub bundle_dir: String,
    /// Checked before the platform's default install locations
    pub system_root: Option<PathBuf>,
    /// Plugin registry cache; defaults beside the executable or in the working directory
    pub registry: Option<PathBuf>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_index: 0,
            width: 640,
            height: 480,
            fps: 30,
            use_gpu: false,
            input: InputFormat::Auto,
            format: PixelFormat::Bgr24,
            custom_pipeline: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gpu_backend: GpuBackend::Auto,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bundle_dir: "gstreamer".into(),
            system_root: None,
            registry: None,
        }
    }
}

impl Config {
    /// Defaults, then `path` (TOML) if given, then `CAMTAP__*` environment variables.
    pub fn load(path: Option<&Path>) -> CaptureResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn request(&self) -> CaptureRequest {
        CaptureRequest::from_config(self)
    }
}
