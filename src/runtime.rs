//! One-time GStreamer bootstrap and element availability checks

use std::collections::BTreeSet;

use gstreamer as gst;
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::{alternatives, Platform};
use crate::environment::EnvironmentContext;
use crate::errors::{CaptureError, CaptureResult};
use crate::pipeline::GpuBackend;

static RUNTIME: OnceCell<RuntimeInfo> = OnceCell::new();

/// State of the initialized runtime
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub version: String,
    pub environment: EnvironmentContext,
}

/// Register `env` with the loader and initialize GStreamer, once per process.
///
/// Later calls return the first registration; a differing context only logs a
/// warning since the loader has already scanned its plugins.
pub fn init(env: &EnvironmentContext) -> CaptureResult<&'static RuntimeInfo> {
    let runtime = RUNTIME.get_or_try_init(|| {
        env.register();
        gst::init()
            .map_err(|e| CaptureError::Runtime(format!("Failed to initialize GStreamer: {e}")))?;

        let version = gst::version_string().to_string();
        info!("Initialized {}", version);
        Ok::<_, CaptureError>(RuntimeInfo {
            version,
            environment: env.clone(),
        })
    })?;

    if runtime.environment != *env {
        warn!(
            active = %runtime.environment.root.display(),
            requested = %env.root.display(),
            "Runtime already initialized from a different location"
        );
    }

    Ok(runtime)
}

/// Lookup of installed element factories
pub trait ElementRegistry {
    fn has(&self, factory: &str) -> bool;
}

/// The live GStreamer registry
#[derive(Debug, Default, Clone, Copy)]
pub struct GstRegistry;

impl ElementRegistry for GstRegistry {
    fn has(&self, factory: &str) -> bool {
        let found = gst::ElementFactory::find(factory).is_some();
        if !found {
            debug!("Element {} not installed", factory);
        }
        found
    }
}

/// Fixed set of factory names, for planning without a runtime
impl ElementRegistry for BTreeSet<&str> {
    fn has(&self, factory: &str) -> bool {
        self.contains(factory)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ElementStatus {
    pub name: String,
    pub available: bool,
    pub description: Option<String>,
}

/// Report of what the runtime can do
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub version: String,
    pub environment: EnvironmentContext,
    pub elements: Vec<ElementStatus>,
}

impl Diagnostics {
    /// Elements every software pipeline needs
    pub fn core_ready(&self) -> bool {
        const CORE: [&str; 6] = [
            "capsfilter",
            "queue",
            "videoconvert",
            "videoscale",
            "videorate",
            "appsink",
        ];
        CORE.iter().all(|name| {
            self.elements
                .iter()
                .any(|e| e.name == *name && e.available)
        })
    }

    pub fn missing(&self) -> impl Iterator<Item = &ElementStatus> {
        self.elements.iter().filter(|e| !e.available)
    }
}

/// Check every element the pipeline builder may reach for on `platform`.
pub fn diagnose(env: &EnvironmentContext, platform: Platform) -> CaptureResult<Diagnostics> {
    let runtime = init(env)?;

    let mut names: Vec<&str> = vec![
        "capsfilter",
        "queue",
        "decodebin",
        "jpegdec",
        "videoconvert",
        "videoscale",
        "videorate",
        "appsink",
        "videotestsrc",
    ];
    names.extend(alternatives(0, platform).iter().map(|s| s.element()));
    for backend in GpuBackend::preference(platform) {
        names.extend(backend.elements().iter().copied());
    }
    let mut seen = BTreeSet::new();
    names.retain(|name| seen.insert(*name));

    let elements = names
        .into_iter()
        .map(|name| {
            let factory = gst::ElementFactory::find(name);
            ElementStatus {
                name: name.to_string(),
                available: factory.is_some(),
                description: factory
                    .as_ref()
                    .and_then(|f| f.metadata("long-name").map(str::to_string)),
            }
        })
        .collect();

    Ok(Diagnostics {
        version: runtime.version.clone(),
        environment: runtime.environment.clone(),
        elements,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_registry_lookup() {
        let registry: BTreeSet<&str> = ["videoconvert", "appsink"].into_iter().collect();
        assert!(registry.has("appsink"));
        assert!(!registry.has("d3d11convert"));
    }
}
