//! Consumer-facing capture session: Idle → Running → Stopped

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, error, info, instrument, warn};

use super::frame::Frame;
use super::source::{alternatives, Platform, SourceDescriptor};
use crate::environment::EnvironmentContext;
use crate::errors::{CaptureError, CaptureResult};
use crate::pipeline::{
    instantiate, instantiate_description, BuiltPipeline, FrameSink, FrameSlot, PipelineBuilder,
    PipelineRequest, SlotStats,
};
use crate::runtime::{self, GstRegistry};
use crate::Config;

/// Granularity of bus polling while starting and while watching
const BUS_POLL: Duration = Duration::from_millis(20);
const WATCH_POLL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
}

/// Everything needed to open a camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub camera_index: u32,
    pub pipeline: PipelineRequest,
    /// How long `start()` waits for the first frame or an error; zero returns at once
    pub start_timeout: Duration,
}

impl CaptureRequest {
    pub fn new(camera_index: u32, width: u32, height: u32, fps: u32, use_gpu: bool) -> Self {
        let mut pipeline = PipelineRequest::new(width, height, fps);
        pipeline.use_gpu = use_gpu;
        Self {
            camera_index,
            pipeline,
            start_timeout: Duration::from_millis(crate::DEFAULT_START_TIMEOUT_MS),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let capture = &config.capture;
        Self {
            camera_index: capture.camera_index,
            pipeline: PipelineRequest {
                width: capture.width,
                height: capture.height,
                fps: capture.fps,
                use_gpu: capture.use_gpu,
                input: capture.input,
                output: capture.format,
                gpu_backend: config.pipeline.gpu_backend,
            },
            start_timeout: Duration::from_millis(config.pipeline.start_timeout_ms),
        }
    }
}

enum SessionSource {
    /// Candidate backends, best first
    Camera(Vec<SourceDescriptor>),
    /// User supplied launch description
    Custom(String),
}

struct Running {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    description: String,
    watcher: Option<BusWatcher>,
}

/// Capture session over one pipeline. Single use: once released it cannot restart.
pub struct CaptureSession {
    state: SessionState,
    source: SessionSource,
    request: PipelineRequest,
    start_timeout: Duration,
    slot: Arc<FrameSlot>,
    active: Arc<AtomicBool>,
    fault: Arc<ArcSwapOption<CaptureError>>,
    running: Option<Running>,
}

impl CaptureSession {
    /// Open the camera at `request.camera_index` with this platform's backends.
    pub fn open(env: &EnvironmentContext, request: CaptureRequest) -> CaptureResult<Self> {
        let candidates = alternatives(request.camera_index, Platform::current());
        Self::with_source(env, SessionSource::Camera(candidates), request)
    }

    /// Open an explicit source, bypassing platform selection.
    pub fn open_with_source(
        env: &EnvironmentContext,
        source: SourceDescriptor,
        request: CaptureRequest,
    ) -> CaptureResult<Self> {
        Self::with_source(env, SessionSource::Camera(vec![source]), request)
    }

    /// Run a custom launch description ending in `appsink name=sink`.
    pub fn from_pipeline(
        env: &EnvironmentContext,
        description: impl Into<String>,
        start_timeout: Duration,
    ) -> CaptureResult<Self> {
        let mut request = CaptureRequest::new(0, 1, 1, 1, false);
        request.start_timeout = start_timeout;
        Self::with_source(env, SessionSource::Custom(description.into()), request)
    }

    fn with_source(
        env: &EnvironmentContext,
        source: SessionSource,
        request: CaptureRequest,
    ) -> CaptureResult<Self> {
        runtime::init(env)?;

        Ok(Self {
            state: SessionState::Idle,
            source,
            request: request.pipeline,
            start_timeout: request.start_timeout,
            slot: Arc::new(FrameSlot::new()),
            active: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(ArcSwapOption::empty()),
            running: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == SessionState::Running
    }

    /// Description of the running pipeline
    pub fn description(&self) -> Option<&str> {
        self.running.as_ref().map(|r| r.description.as_str())
    }

    /// Build and start the pipeline.
    ///
    /// A no-op when already running. On failure the pipeline is torn down and
    /// the session stays `Idle`.
    #[instrument(skip(self))]
    pub fn start(&mut self) -> CaptureResult<()> {
        match self.state {
            SessionState::Running => {
                debug!("Session already running");
                return Ok(());
            }
            SessionState::Stopped => return Err(CaptureError::SessionClosed),
            SessionState::Idle => {}
        }

        let (built, device, expected) = self.build()?;
        info!("Pipeline: {}", built.description);

        self.fault.store(None);
        self.active.store(true, Ordering::Release);
        FrameSink::new(Arc::clone(&self.slot), Arc::clone(&self.active), expected)
            .attach(&built.appsink);

        if let Err(e) = self.launch(&built.pipeline, &device) {
            self.active.store(false, Ordering::Release);
            teardown(&built.pipeline, &built.appsink);
            self.slot.clear();
            warn!(error = %e, "Failed to start capture");
            return Err(e);
        }

        let watcher = match built.pipeline.bus() {
            Some(bus) => BusWatcher::spawn(bus, Arc::clone(&self.fault), device)
                .map_err(|e| warn!("Bus watcher unavailable: {}", e))
                .ok(),
            None => None,
        };

        self.running = Some(Running {
            pipeline: built.pipeline,
            appsink: built.appsink,
            description: built.description,
            watcher,
        });
        self.state = SessionState::Running;
        info!("Capture session running");
        Ok(())
    }

    fn build(&self) -> CaptureResult<(BuiltPipeline, String, Option<crate::PixelFormat>)> {
        match &self.source {
            SessionSource::Camera(candidates) => {
                let plan =
                    PipelineBuilder::new(&GstRegistry).plan_first(candidates, &self.request)?;
                let device = plan.source.device_label();
                let built = instantiate(&plan)?;
                Ok((built, device, Some(self.request.output)))
            }
            SessionSource::Custom(description) => {
                let built = instantiate_description(description)?;
                Ok((built, "custom pipeline".to_string(), None))
            }
        }
    }

    /// READY synchronously (opens the device), then PLAYING, then wait for the
    /// first frame or an error within the start timeout.
    fn launch(&self, pipeline: &gst::Pipeline, device: &str) -> CaptureResult<()> {
        let bus = pipeline
            .bus()
            .ok_or_else(|| CaptureError::Runtime("pipeline has no bus".into()))?;

        if pipeline.set_state(gst::State::Ready).is_err() {
            return Err(pending_error(&bus, device).unwrap_or_else(|| {
                CaptureError::DeviceUnavailable {
                    device: device.to_string(),
                    reason: "source failed to open".into(),
                }
            }));
        }

        if pipeline.set_state(gst::State::Playing).is_err() {
            return Err(pending_error(&bus, device).unwrap_or_else(|| {
                CaptureError::Runtime("failed to set pipeline to PLAYING".into())
            }));
        }

        if self.start_timeout.is_zero() {
            return Ok(());
        }

        let deadline = Instant::now() + self.start_timeout;
        loop {
            if self.slot.has_frame() {
                debug!("First frame received");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout_ms = self.start_timeout.as_millis() as u64,
                    "No frame yet, continuing in background"
                );
                return Ok(());
            }

            let msg = bus.timed_pop_filtered(
                gst::ClockTime::from_mseconds(BUS_POLL.as_millis() as u64),
                &[gst::MessageType::Error, gst::MessageType::Eos],
            );
            if let Some(msg) = msg {
                match msg.view() {
                    gst::MessageView::Error(err) => return Err(classify(err, device)),
                    gst::MessageView::Eos(..) => {
                        return Err(CaptureError::DeviceUnavailable {
                            device: device.to_string(),
                            reason: "stream ended during startup".into(),
                        })
                    }
                    _ => {}
                }
            }
        }
    }

    /// `(true, frame)` with the newest frame, or `(false, None)`. Never blocks.
    pub fn read(&self) -> (bool, Option<Frame>) {
        match self.latest() {
            Some(frame) => (true, Some(frame)),
            None => (false, None),
        }
    }

    /// Newest frame while running.
    pub fn latest(&self) -> Option<Frame> {
        if self.state != SessionState::Running {
            return None;
        }
        self.slot.latest()
    }

    /// Newest frame only if no earlier read returned it.
    pub fn read_fresh(&self) -> Option<Frame> {
        if self.state != SessionState::Running {
            return None;
        }
        self.slot.take_fresh()
    }

    pub fn stats(&self) -> SlotStats {
        self.slot.stats()
    }

    /// Last error the pipeline posted after startup, if any
    pub fn last_fault(&self) -> Option<Arc<CaptureError>> {
        self.fault.load_full()
    }

    /// Stop the pipeline and end the session. Idempotent.
    #[instrument(skip(self))]
    pub fn release(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }

        self.active.store(false, Ordering::Release);
        if let Some(running) = self.running.take() {
            if let Some(watcher) = running.watcher {
                watcher.stop();
            }
            teardown(&running.pipeline, &running.appsink);
        }
        self.slot.clear();
        self.state = SessionState::Stopped;

        let stats = self.slot.stats();
        info!(
            published = stats.published,
            superseded = stats.superseded,
            decode_faults = stats.decode_faults,
            "Capture session released"
        );
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Detach the sink and drive the pipeline to NULL, waiting for teardown.
fn teardown(pipeline: &gst::Pipeline, appsink: &gst_app::AppSink) {
    FrameSink::detach(appsink);
    if let Err(e) = pipeline.set_state(gst::State::Null) {
        warn!("Failed to stop pipeline: {:?}", e);
    }
    let (result, state, _) = pipeline.state(gst::ClockTime::from_seconds(5));
    debug!(result = ?result, state = ?state, "Pipeline stopped");
}

fn pending_error(bus: &gst::Bus, device: &str) -> Option<CaptureError> {
    let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
    match msg.view() {
        gst::MessageView::Error(err) => Some(classify(err, device)),
        _ => None,
    }
}

fn classify(err: &gst::message::Error, device: &str) -> CaptureError {
    let debug = err.debug().map(|d| d.to_string());
    CaptureError::from_bus_error(&err.error(), debug.as_deref(), device)
}

/// Background thread draining the bus after startup
struct BusWatcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl BusWatcher {
    fn spawn(
        bus: gst::Bus,
        fault: Arc<ArcSwapOption<CaptureError>>,
        device: String,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("camtap-bus".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    let Some(msg) = bus.timed_pop_filtered(
                        gst::ClockTime::from_mseconds(WATCH_POLL_MS),
                        &[
                            gst::MessageType::Error,
                            gst::MessageType::Warning,
                            gst::MessageType::Eos,
                        ],
                    ) else {
                        continue;
                    };

                    match msg.view() {
                        gst::MessageView::Error(err) => {
                            let e = classify(err, &device);
                            error!(error = %e, "Pipeline error");
                            fault.store(Some(Arc::new(e)));
                        }
                        gst::MessageView::Warning(w) => {
                            warn!("Pipeline warning: {}", w.error());
                        }
                        gst::MessageView::Eos(..) => {
                            info!("End of stream from {}", device);
                        }
                        _ => {}
                    }
                }
            })?;

        Ok(Self { stop, handle })
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            warn!("Bus watcher panicked");
        }
    }
}
