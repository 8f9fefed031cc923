//! camtap: headless camera capture front end

use std::path::PathBuf;
use std::time::{Duration, Instant};

use camtap::capture::{select, Platform, SourceDescriptor};
use camtap::{runtime, utils, CaptureSession, Config, EnvironmentContext};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Indices tried when the device monitor reports no cameras
const FALLBACK_INDICES: u32 = 10;

#[derive(Parser)]
#[command(name = "camtap")]
#[command(about = "Capture frames from a camera through GStreamer")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a camera and read frames until interrupted
    Capture(CaptureArgs),
    /// List cameras found by the device monitor, or by opening indices
    List,
    /// Check which pipeline elements the runtime provides
    Doctor,
    /// Show the resolved GStreamer runtime
    Env,
}

#[derive(clap::Args, Default)]
struct CaptureArgs {
    #[arg(short = 'i', long)]
    camera: Option<u32>,

    #[arg(short = 'W', long)]
    width: Option<u32>,

    #[arg(short = 'H', long)]
    height: Option<u32>,

    #[arg(short, long)]
    fps: Option<u32>,

    /// Prefer GPU scaling and decoding
    #[arg(short, long)]
    gpu: bool,

    /// Stop after this many seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Write the first frame as PNG
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Custom launch description ending in `appsink name=sink`
    #[arg(short, long, conflicts_with = "test_pattern")]
    pipeline: Option<String>,

    /// Use a synthetic source (e.g. smpte, ball) instead of a camera
    #[arg(long)]
    test_pattern: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camtap=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Capture(CaptureArgs::default())) {
        Commands::Capture(args) => capture(config, args).await,
        Commands::List => list(&config),
        Commands::Doctor => doctor(&config),
        Commands::Env => show_env(&config),
    }
}

async fn capture(mut config: Config, args: CaptureArgs) -> Result<()> {
    let capture = &mut config.capture;
    if let Some(camera) = args.camera {
        capture.camera_index = camera;
    }
    if let Some(width) = args.width {
        capture.width = width;
    }
    if let Some(height) = args.height {
        capture.height = height;
    }
    if let Some(fps) = args.fps {
        capture.fps = fps;
    }
    capture.use_gpu |= args.gpu;
    if args.pipeline.is_some() {
        capture.custom_pipeline = args.pipeline;
    }

    let env = EnvironmentContext::resolve(&config.runtime)?;
    info!("Using {:?} runtime at {}", env.mode, env.root.display());

    let request = config.request();
    let mut session = match (&config.capture.custom_pipeline, args.test_pattern) {
        (Some(description), _) => {
            CaptureSession::from_pipeline(&env, description.as_str(), request.start_timeout)?
        }
        (None, Some(pattern)) => {
            let source = SourceDescriptor::TestPattern {
                pattern,
                width: config.capture.width,
                height: config.capture.height,
                framerate: config.capture.fps,
            };
            CaptureSession::open_with_source(&env, source, request)?
        }
        (None, None) => CaptureSession::open(&env, request)?,
    };
    session.start()?;
    if let Some(description) = session.description() {
        info!("Running: {}", description);
    }

    let period = Duration::from_secs(1) / config.capture.fps.max(1);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut snapshot = args.snapshot;
    let mut frames = 0u64;
    let started = Instant::now();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                if let Some(fault) = session.last_fault() {
                    session.release();
                    return Err(eyre!("capture failed: {fault}"));
                }

                if let Some(frame) = session.read_fresh() {
                    frames += 1;
                    if frames % 30 == 0 {
                        let stats = session.stats();
                        let fps = frames as f64 / started.elapsed().as_secs_f64();
                        info!(
                            "Frame {} {}x{} | {:.1} fps | {} superseded | {} faults",
                            frame.sequence(),
                            frame.width(),
                            frame.height(),
                            fps,
                            stats.superseded,
                            stats.decode_faults
                        );
                    }
                    if let Some(path) = snapshot.take() {
                        frame.to_rgb_image().save(&path)?;
                        info!("Saved snapshot to {}", path.display());
                    }
                }

                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
            }
        }
    }

    if frames == 0 {
        warn!("No frames received");
    }
    session.release();
    info!("Read {} frames in {:.1}s", frames, started.elapsed().as_secs_f64());
    Ok(())
}

fn list(config: &Config) -> Result<()> {
    let env = EnvironmentContext::resolve(&config.runtime)?;
    let cameras = utils::list_cameras(&env)?;
    let platform = Platform::current();
    if cameras.is_empty() {
        info!("Device monitor found nothing, trying indices 0..{}", FALLBACK_INDICES);
        let openable = utils::openable_indices(&env, platform, FALLBACK_INDICES);
        if openable.is_empty() {
            println!("No cameras found");
        }
        for (index, source) in openable {
            println!("[{index}] {} ({source})", source.device_label());
        }
        return Ok(());
    }

    for camera in cameras {
        println!(
            "[{}] {} ({})",
            camera.index,
            camera.name,
            select(camera.index, platform)
        );
        if let Some(path) = &camera.path {
            println!("    path: {path}");
            #[cfg(target_os = "linux")]
            {
                if let Ok(node) = utils::v4l_formats(std::path::Path::new(path)) {
                    println!("    driver: {} formats: {}", node.driver, node.formats.join(" "));
                }
            }
        }
        for mode in &camera.modes {
            println!("    {}x{} @ {} fps", mode.width, mode.height, mode.fps);
        }
    }
    Ok(())
}

fn doctor(config: &Config) -> Result<()> {
    let env = EnvironmentContext::resolve(&config.runtime)?;
    let report = runtime::diagnose(&env, Platform::current())?;

    println!("{}", report.version);
    println!("{:?} runtime at {}", report.environment.mode, report.environment.root.display());
    for element in &report.elements {
        let mark = if element.available { "✓" } else { "✗" };
        match &element.description {
            Some(description) => println!("  {mark} {:<16} {}", element.name, description),
            None => println!("  {mark} {}", element.name),
        }
    }

    if !report.core_ready() {
        let missing: Vec<_> = report.missing().map(|e| e.name.as_str()).collect();
        return Err(eyre!("runtime is missing core elements: {}", missing.join(", ")));
    }
    Ok(())
}

fn show_env(config: &Config) -> Result<()> {
    let env = EnvironmentContext::resolve(&config.runtime)?;
    println!("mode:     {:?}", env.mode);
    println!("root:     {}", env.root.display());
    println!("bin:      {}", env.bin_dir.display());
    println!("plugins:  {}", env.plugin_dir.display());
    match &env.scanner {
        Some(scanner) => println!("scanner:  {}", scanner.display()),
        None => println!("scanner:  (none)"),
    }
    println!("registry: {}", env.registry.display());
    Ok(())
}
