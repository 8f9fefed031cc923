//! Builds the fixed capture chain and instantiates it as a GStreamer pipeline.
//!
//! ```text
//! source ─► queue(leaky, 1) ─► [decode] ─► videoconvert ─► videorate(drop-only)
//!        ─► scale (software or GPU) ─► size caps ─► videoconvert ─► format caps ─► appsink
//! ```

use std::fmt;
use std::str::FromStr;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::stage::{Accepts, MediaContract, Memory, StageDescriptor, StageKind};
use crate::capture::{ParamValue, PixelFormat, Platform, SourceDescriptor};
use crate::errors::{CaptureError, CaptureResult};
use crate::runtime::ElementRegistry;

/// Name the frame sink is looked up by, also required in custom descriptions
pub const SINK_NAME: &str = "sink";

/// What the camera is asked to emit before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputFormat {
    /// Let `decodebin` handle whatever the device negotiates
    #[default]
    Auto,
    Raw,
    Mjpeg,
}

/// GPU implementation substituted for the software scale stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    #[default]
    Auto,
    D3d11,
    Va,
    OpenGl,
}

impl GpuBackend {
    /// Concrete backends worth trying on `platform`, best first.
    pub fn preference(platform: Platform) -> Vec<GpuBackend> {
        match platform {
            Platform::Windows => vec![GpuBackend::D3d11, GpuBackend::OpenGl],
            Platform::Linux => vec![GpuBackend::Va, GpuBackend::OpenGl],
            Platform::MacOs => vec![GpuBackend::OpenGl],
        }
    }

    pub fn elements(self) -> &'static [&'static str] {
        match self {
            GpuBackend::Auto => &[],
            GpuBackend::D3d11 => &["d3d11upload", "d3d11convert", "d3d11download"],
            GpuBackend::Va => &["vapostproc"],
            GpuBackend::OpenGl => &["glupload", "glcolorconvert", "glcolorscale", "gldownload"],
        }
    }

    fn stages(self) -> Vec<StageDescriptor> {
        let gpu = MediaContract::Raw {
            memory: Memory::Gpu,
            format: None,
        };
        let upload = |factory: &str| {
            StageDescriptor::new(
                StageKind::ConvertFilter,
                factory,
                Accepts::Raw(Memory::System),
                gpu,
            )
        };
        let on_gpu = |kind: StageKind, factory: &str| {
            StageDescriptor::new(kind, factory, Accepts::Raw(Memory::Gpu), gpu)
        };
        let download = |factory: &str| {
            StageDescriptor::new(
                StageKind::ConvertFilter,
                factory,
                Accepts::Raw(Memory::Gpu),
                MediaContract::RAW,
            )
        };

        match self {
            GpuBackend::Auto => Vec::new(),
            GpuBackend::D3d11 => vec![
                upload("d3d11upload"),
                on_gpu(StageKind::ScaleFilter, "d3d11convert"),
                download("d3d11download"),
            ],
            // vapostproc maps system memory in and out on its own
            GpuBackend::Va => vec![StageDescriptor::new(
                StageKind::ScaleFilter,
                "vapostproc",
                Accepts::Raw(Memory::System),
                MediaContract::RAW,
            )],
            GpuBackend::OpenGl => vec![
                upload("glupload"),
                on_gpu(StageKind::ConvertFilter, "glcolorconvert"),
                on_gpu(StageKind::ScaleFilter, "glcolorscale"),
                download("gldownload"),
            ],
        }
    }
}

/// Output shape requested by the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineRequest {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub use_gpu: bool,
    pub input: InputFormat,
    pub output: PixelFormat,
    pub gpu_backend: GpuBackend,
}

impl PipelineRequest {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            use_gpu: false,
            input: InputFormat::Auto,
            output: PixelFormat::Bgr24,
            gpu_backend: GpuBackend::Auto,
        }
    }
}

/// A validated chain of stages, not yet instantiated.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePlan {
    pub source: SourceDescriptor,
    pub stages: Vec<StageDescriptor>,
    pub output: PixelFormat,
}

impl PipelinePlan {
    /// Check chain shape and every stage boundary.
    pub fn validate(&self) -> CaptureResult<()> {
        match (self.stages.first(), self.stages.last()) {
            (Some(first), Some(last))
                if first.kind == StageKind::Source && last.kind == StageKind::Sink => {}
            _ => {
                return Err(CaptureError::PipelineConstruction(
                    "chain must run from a source to a sink".into(),
                ))
            }
        }

        for pair in self.stages.windows(2) {
            let (up, down) = (&pair[0], &pair[1]);
            if !down.input.admits(up.output) {
                return Err(CaptureError::PipelineConstruction(format!(
                    "{} emits {:?}, which {} does not accept ({:?})",
                    up.factory, up.output, down.factory, down.input
                )));
            }
        }
        Ok(())
    }

    pub fn has_stage(&self, factory: &str) -> bool {
        self.stages.iter().any(|s| s.factory == factory)
    }

    pub fn stages_of(&self, kind: StageKind) -> impl Iterator<Item = &StageDescriptor> {
        self.stages.iter().filter(move |s| s.kind == kind)
    }
}

impl fmt::Display for PipelinePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                write!(f, " ! ")?;
            }
            write!(f, "{stage}")?;
        }
        Ok(())
    }
}

/// Structural builder over an element registry
pub struct PipelineBuilder<'a> {
    registry: &'a dyn ElementRegistry,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(registry: &'a dyn ElementRegistry) -> Self {
        Self { registry }
    }

    /// Plan with the first candidate source whose element is installed.
    pub fn plan_first(
        &self,
        candidates: &[SourceDescriptor],
        request: &PipelineRequest,
    ) -> CaptureResult<PipelinePlan> {
        let source = candidates
            .iter()
            .find(|s| {
                let found = self.registry.has(s.element());
                if !found {
                    info!("✗ Source {} not available", s.element());
                }
                found
            })
            .ok_or_else(|| {
                let names: Vec<_> = candidates.iter().map(|s| s.element()).collect();
                CaptureError::PipelineConstruction(format!(
                    "no camera source element installed (tried {})",
                    names.join(", ")
                ))
            })?;
        info!("✓ Using source {}", source.element());
        self.plan(source, request)
    }

    pub fn plan(
        &self,
        source: &SourceDescriptor,
        request: &PipelineRequest,
    ) -> CaptureResult<PipelinePlan> {
        let max_rate = i32::try_from(request.fps).map_err(|_| {
            CaptureError::PipelineConstruction(format!("frame rate {} too large", request.fps))
        })?;
        if request.width == 0 || request.height == 0 || request.fps == 0 {
            return Err(CaptureError::PipelineConstruction(format!(
                "invalid mode {}x{}@{}",
                request.width, request.height, request.fps
            )));
        }

        let mut stages = Vec::new();

        // Source
        let source_output = match (source.native_mode(), request.input) {
            (Some(_), _) | (None, InputFormat::Raw) => MediaContract::RAW,
            (None, InputFormat::Mjpeg) => MediaContract::Encoded,
            (None, InputFormat::Auto) => MediaContract::Any,
        };
        let mut src = StageDescriptor::new(
            StageKind::Source,
            source.element(),
            Accepts::Nothing,
            source_output,
        );
        for (name, value) in source.params() {
            src = src.param(name, value);
        }
        stages.push(src);

        if let Some((w, h, rate)) = source.native_mode() {
            stages.push(StageDescriptor::caps_filter(
                format!("video/x-raw,width={w},height={h},framerate={rate}/1"),
                Accepts::Raw(Memory::System),
                MediaContract::RAW,
            ));
        } else if request.input == InputFormat::Mjpeg {
            stages.push(StageDescriptor::caps_filter(
                "image/jpeg",
                Accepts::Encoded,
                MediaContract::Encoded,
            ));
        }

        // Single-buffer leaky queue: stale frames are dropped before decode
        stages.push(
            StageDescriptor::new(StageKind::Queue, "queue", Accepts::Anything, source_output)
                .param("max-size-buffers", ParamValue::UInt(1))
                .param("max-size-bytes", ParamValue::UInt(0))
                .param("max-size-time", ParamValue::UInt(0))
                .param("leaky", ParamValue::Str("downstream".into())),
        );

        // Decode
        match source_output {
            MediaContract::Any => stages.push(StageDescriptor::new(
                StageKind::Decode,
                "decodebin",
                Accepts::Encoded,
                MediaContract::RAW,
            )),
            MediaContract::Encoded => stages.push(StageDescriptor::new(
                StageKind::Decode,
                self.jpeg_decoder(request.use_gpu),
                Accepts::Encoded,
                MediaContract::RAW,
            )),
            MediaContract::Raw { .. } => {}
        }

        // Color-space normalize
        stages.push(software(StageKind::ConvertFilter, "videoconvert"));

        // Drop-only rate limit
        stages.push(
            software(StageKind::RateFilter, "videorate")
                .param("drop-only", ParamValue::Bool(true))
                .param("max-rate", ParamValue::Int(max_rate)),
        );

        // Scale
        match self.gpu_backend(request) {
            Some(backend) => {
                info!("Using GPU backend {:?} for scaling", backend);
                stages.extend(backend.stages());
            }
            None => stages.push(software(StageKind::ScaleFilter, "videoscale")),
        }
        stages.push(StageDescriptor::caps_filter(
            format!("video/x-raw,width={},height={}", request.width, request.height),
            Accepts::Raw(Memory::System),
            MediaContract::RAW,
        ));

        // Final convert
        let packed = MediaContract::Raw {
            memory: Memory::System,
            format: Some(request.output),
        };
        stages.push(software(StageKind::ConvertFilter, "videoconvert"));
        stages.push(StageDescriptor::caps_filter(
            format!(
                "video/x-raw,format={},width={},height={}",
                request.output.caps_name(),
                request.width,
                request.height
            ),
            Accepts::Raw(Memory::System),
            packed,
        ));

        // Sink
        stages.push(
            StageDescriptor::new(
                StageKind::Sink,
                "appsink",
                Accepts::Packed(request.output),
                packed,
            )
            .param("name", ParamValue::Str(SINK_NAME.into()))
            .param("emit-signals", ParamValue::Bool(false))
            .param("max-buffers", ParamValue::UInt(1))
            .param("drop", ParamValue::Bool(true))
            .param("sync", ParamValue::Bool(false))
            .param("enable-last-sample", ParamValue::Bool(false)),
        );

        let plan = PipelinePlan {
            source: source.clone(),
            stages,
            output: request.output,
        };

        if let Some(missing) = plan
            .stages
            .iter()
            .find(|s| !self.registry.has(&s.factory))
        {
            return Err(CaptureError::PipelineConstruction(format!(
                "element {} is not installed",
                missing.factory
            )));
        }
        plan.validate()?;

        debug!("Planned pipeline: {}", plan);
        Ok(plan)
    }

    /// Best JPEG decoder: hardware only when GPU use is allowed.
    fn jpeg_decoder(&self, use_gpu: bool) -> &'static str {
        if use_gpu {
            let decoders = ["nvjpegdec", "vaapijpegdec", "v4l2jpegdec"];
            for decoder in decoders {
                if self.registry.has(decoder) {
                    info!("Using JPEG decoder: {}", decoder);
                    return decoder;
                }
            }
            warn!("No hardware JPEG decoder found, using software decoder");
        }
        "jpegdec"
    }

    /// GPU backend to substitute for software scaling, if any is usable.
    fn gpu_backend(&self, request: &PipelineRequest) -> Option<GpuBackend> {
        if !request.use_gpu {
            return None;
        }

        let candidates = match request.gpu_backend {
            GpuBackend::Auto => GpuBackend::preference(Platform::current()),
            explicit => vec![explicit],
        };
        let chosen = candidates
            .into_iter()
            .find(|b| b.elements().iter().all(|e| self.registry.has(e)));

        if chosen.is_none() {
            warn!(
                requested = ?request.gpu_backend,
                "GPU scaling unavailable, falling back to software"
            );
        }
        chosen
    }
}

fn software(kind: StageKind, factory: &str) -> StageDescriptor {
    StageDescriptor::new(kind, factory, Accepts::Raw(Memory::System), MediaContract::RAW)
}

/// A constructed pipeline and its frame sink
pub struct BuiltPipeline {
    pub pipeline: gst::Pipeline,
    pub appsink: gst_app::AppSink,
    pub description: String,
}

/// Create, configure and link the elements of `plan`.
///
/// Nothing is started; on error the partially built bin is dropped.
pub fn instantiate(plan: &PipelinePlan) -> CaptureResult<BuiltPipeline> {
    plan.validate()?;

    let pipeline = gst::Pipeline::new();
    let mut elements = Vec::with_capacity(plan.stages.len());
    for stage in &plan.stages {
        let element = make_element(stage)?;
        pipeline.add(&element)?;
        elements.push(element);
    }

    for (pair, stages) in elements.windows(2).zip(plan.stages.windows(2)) {
        let (up, down) = (&pair[0], &pair[1]);
        if stages[0].kind == StageKind::Decode && stages[0].factory == "decodebin" {
            link_dynamic(up, down)?;
            continue;
        }
        up.link(down).map_err(|_| {
            CaptureError::PipelineConstruction(format!(
                "cannot link {} to {}",
                stages[0], stages[1]
            ))
        })?;
    }

    let appsink = appsink(&pipeline)?;
    Ok(BuiltPipeline {
        pipeline,
        appsink,
        description: plan.to_string(),
    })
}

/// Parse a user supplied launch description; it must name its appsink `sink`.
pub fn instantiate_description(description: &str) -> CaptureResult<BuiltPipeline> {
    let pipeline = gst::parse::launch(description)
        .map_err(|e| CaptureError::PipelineConstruction(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| {
            CaptureError::PipelineConstruction("description is not a pipeline".into())
        })?;
    let appsink = appsink(&pipeline)?;

    Ok(BuiltPipeline {
        pipeline,
        appsink,
        description: description.to_string(),
    })
}

fn appsink(pipeline: &gst::Pipeline) -> CaptureResult<gst_app::AppSink> {
    pipeline
        .by_name(SINK_NAME)
        .ok_or_else(|| {
            CaptureError::PipelineConstruction(format!(
                "pipeline must contain 'appsink name={SINK_NAME}'"
            ))
        })?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| {
            CaptureError::PipelineConstruction(format!("element '{SINK_NAME}' is not an appsink"))
        })
}

fn make_element(stage: &StageDescriptor) -> CaptureResult<gst::Element> {
    let element = gst::ElementFactory::make(&stage.factory)
        .build()
        .map_err(|e| {
            CaptureError::PipelineConstruction(format!("cannot create {}: {}", stage.factory, e))
        })?;

    for (name, value) in &stage.params {
        let value = property_value(&element, &stage.factory, name, value)?;
        element.set_property_from_value(name, &value);
    }

    if let Some(caps) = &stage.caps {
        let caps = gst::Caps::from_str(caps).map_err(|e| {
            CaptureError::PipelineConstruction(format!("invalid caps {caps}: {e}"))
        })?;
        element.set_property("caps", &caps);
    }

    Ok(element)
}

/// Parse `value` against the property's declared type and range.
///
/// `set_property_from_str` aborts on bad input; user supplied values (test
/// patterns, device indices) must fail as construction errors instead.
fn property_value(
    element: &gst::Element,
    factory: &str,
    name: &str,
    value: &ParamValue,
) -> CaptureResult<glib::Value> {
    let invalid = |detail: String| {
        CaptureError::PipelineConstruction(format!("{factory} property {name}: {detail}"))
    };

    let pspec = element
        .find_property(name)
        .ok_or_else(|| invalid("no such property".into()))?;
    let text = value.to_string();
    let parsed = glib::Value::deserialize(&text, pspec.value_type())
        .map_err(|_| invalid(format!("cannot parse {text:?} as {}", pspec.value_type())))?;

    if let Some(range) = pspec.downcast_ref::<glib::ParamSpecInt>() {
        let v = parsed.get::<i32>().map_err(|e| invalid(e.to_string()))?;
        if v < range.minimum() || v > range.maximum() {
            return Err(invalid(format!(
                "{v} outside {}..={}",
                range.minimum(),
                range.maximum()
            )));
        }
    } else if let Some(range) = pspec.downcast_ref::<glib::ParamSpecUInt>() {
        let v = parsed.get::<u32>().map_err(|e| invalid(e.to_string()))?;
        if v < range.minimum() || v > range.maximum() {
            return Err(invalid(format!(
                "{v} outside {}..={}",
                range.minimum(),
                range.maximum()
            )));
        }
    }

    Ok(parsed)
}

/// Link `decodebin`'s sometimes-pad to `downstream` once it appears.
fn link_dynamic(decodebin: &gst::Element, downstream: &gst::Element) -> CaptureResult<()> {
    let sink_pad = downstream.static_pad("sink").ok_or_else(|| {
        CaptureError::PipelineConstruction("downstream of decodebin has no sink pad".into())
    })?;

    decodebin.connect_pad_added(move |_, src_pad| {
        if sink_pad.is_linked() {
            return;
        }
        let is_video = src_pad
            .current_caps()
            .and_then(|caps| caps.structure(0).map(|s| s.name().starts_with("video/")))
            .unwrap_or(true);
        if !is_video {
            debug!("Ignoring non-video pad {}", src_pad.name());
            return;
        }
        if let Err(e) = src_pad.link(&sink_pad) {
            warn!("Failed to link decoded pad: {:?}", e);
        }
    });
    Ok(())
}
