//! Locates the GStreamer runtime: a bundle next to the executable, or a system install.
//!
//! A bundle is a `<exe_dir>/gstreamer` tree produced by packaging tooling. The
//! Windows installer layout (`bin/`, `lib/`, `lib/gstreamer-1.0/`) and the Linux
//! bundle layout (`lib/`, `plugins/`, `bin/gst-plugin-scanner`) are both accepted.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::Platform;
use crate::errors::{CaptureError, CaptureResult};
use crate::RuntimeConfig;

/// Where the runtime was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Libraries and plugins shipped next to the executable
    Bundled,
    /// Development checkout using an installed runtime
    System,
}

/// Resolved runtime locations, immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentContext {
    pub mode: RuntimeMode,
    pub root: PathBuf,
    pub bin_dir: PathBuf,
    pub lib_dir: PathBuf,
    pub plugin_dir: PathBuf,
    pub scanner: Option<PathBuf>,
    pub registry: PathBuf,
}

impl EnvironmentContext {
    /// Resolve relative to the running executable.
    pub fn resolve(config: &RuntimeConfig) -> CaptureResult<Self> {
        let exe = env::current_exe()
            .and_then(|p| p.canonicalize())
            .map_err(|e| CaptureError::Runtime(format!("cannot locate executable: {e}")))?;
        let exe_dir = exe.parent().unwrap_or(Path::new("."));
        Self::resolve_from(exe_dir, config, Platform::current())
    }

    pub fn resolve_from(
        exe_dir: &Path,
        config: &RuntimeConfig,
        platform: Platform,
    ) -> CaptureResult<Self> {
        let bundle = exe_dir.join(&config.bundle_dir);
        if bundle.is_dir() {
            info!("Detected bundled runtime at {}", bundle.display());
            let registry = config
                .registry
                .clone()
                .unwrap_or_else(|| exe_dir.join("registry.bin"));
            let lib_dir = bundle.join("lib");
            return Ok(Self::layout(
                RuntimeMode::Bundled,
                bundle,
                lib_dir,
                registry,
                platform,
            ));
        }

        let mut searched = vec![bundle];
        let candidates = system_candidates(config, platform);
        for candidate in candidates {
            if let Some((root, lib_dir)) = system_root(&candidate, platform) {
                info!("Detected system runtime at {}", lib_dir.display());
                let registry = config
                    .registry
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("registry.bin"));
                return Ok(Self::layout(
                    RuntimeMode::System,
                    root,
                    lib_dir,
                    registry,
                    platform,
                ));
            }
            searched.push(candidate);
        }

        Err(CaptureError::RuntimeNotFound { searched })
    }

    fn layout(
        mode: RuntimeMode,
        root: PathBuf,
        lib_dir: PathBuf,
        registry: PathBuf,
        platform: Platform,
    ) -> Self {
        let bin_dir = root.join("bin");

        let plugin_dir = [lib_dir.join("gstreamer-1.0"), root.join("plugins")]
            .into_iter()
            .find(|p| p.is_dir())
            .unwrap_or_else(|| lib_dir.join("gstreamer-1.0"));

        let scanner_name = match platform {
            Platform::Windows => "gst-plugin-scanner.exe",
            _ => "gst-plugin-scanner",
        };
        let scanner = [
            plugin_dir.join(scanner_name),
            bin_dir.join(scanner_name),
            root.join("libexec").join("gstreamer-1.0").join(scanner_name),
            lib_dir.join("gstreamer1.0").join("gstreamer-1.0").join(scanner_name),
        ]
        .into_iter()
        .find(|p| p.is_file());

        if scanner.is_none() {
            debug!("No plugin scanner under {}", root.display());
        }

        Self {
            mode,
            root,
            bin_dir,
            lib_dir,
            plugin_dir,
            scanner,
            registry,
        }
    }

    /// Export the resolved locations to the GStreamer loader.
    ///
    /// Must run before `gst::init()`; the loader reads these once when it scans
    /// plugins. Prefer `runtime::init`, which orders the two calls.
    pub fn register(&self) {
        if self.bin_dir.is_dir() {
            let mut paths = vec![self.bin_dir.clone()];
            if let Some(existing) = env::var_os("PATH") {
                paths.extend(env::split_paths(&existing));
            }
            match env::join_paths(paths) {
                Ok(joined) => env::set_var("PATH", joined),
                Err(e) => warn!("Could not extend PATH: {}", e),
            }
        }

        set_path_var("GST_PLUGIN_PATH", &self.plugin_dir);
        if self.mode == RuntimeMode::Bundled {
            // Keep system plugins out of a bundle
            set_path_var("GST_PLUGIN_SYSTEM_PATH", &self.plugin_dir);
        }
        set_path_var("GST_REGISTRY", &self.registry);
        if let Some(scanner) = &self.scanner {
            set_path_var("GST_PLUGIN_SCANNER", scanner);
        }

        info!(
            mode = ?self.mode,
            root = %self.root.display(),
            plugins = %self.plugin_dir.display(),
            "Registered GStreamer runtime"
        );
    }
}

fn set_path_var(key: &str, value: &Path) {
    debug!("{}={}", key, value.display());
    env::set_var(key, OsString::from(value.as_os_str()));
}

/// Candidate roots in preference order.
fn system_candidates(config: &RuntimeConfig, platform: Platform) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(root) = &config.system_root {
        candidates.push(root.clone());
    }

    match platform {
        Platform::Windows => {
            if let Some(root) = env::var_os("GSTREAMER_1_0_ROOT_MSVC_X86_64") {
                candidates.push(PathBuf::from(root));
            }
            candidates.push(PathBuf::from(r"C:\gstreamer\1.0\msvc_x86_64"));
        }
        Platform::Linux => {
            candidates.extend(
                [
                    "/usr/lib/x86_64-linux-gnu",
                    "/usr/lib/aarch64-linux-gnu",
                    "/usr/lib64",
                    "/usr/lib",
                ]
                .map(PathBuf::from),
            );
        }
        Platform::MacOs => {
            candidates.push(PathBuf::from(
                "/Library/Frameworks/GStreamer.framework/Versions/1.0",
            ));
        }
    }

    candidates
}

/// Normalize a candidate into `(root, lib_dir)` if it holds plugins.
///
/// Linux multiarch library dirs (`/usr/lib/x86_64-linux-gnu`) carry
/// `gstreamer-1.0` directly; the candidate is then the lib dir and its parent
/// the root.
fn system_root(candidate: &Path, platform: Platform) -> Option<(PathBuf, PathBuf)> {
    if candidate.join("lib").join("gstreamer-1.0").is_dir() {
        return Some((candidate.to_path_buf(), candidate.join("lib")));
    }
    if platform == Platform::Linux && candidate.join("gstreamer-1.0").is_dir() {
        let root = candidate.parent().unwrap_or(candidate).to_path_buf();
        return Some((root, candidate.to_path_buf()));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!(
            "camtap-env-{}-{}-{}",
            name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config_without_system() -> RuntimeConfig {
        RuntimeConfig {
            system_root: Some(PathBuf::from("/nonexistent/camtap/runtime")),
            ..RuntimeConfig::default()
        }
    }

    #[test]
    fn bundled_windows_layout() {
        let exe_dir = scratch("win");
        let root = exe_dir.join("gstreamer");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib").join("gstreamer-1.0")).unwrap();
        fs::write(root.join("bin").join("gst-plugin-scanner.exe"), b"").unwrap();

        let ctx = EnvironmentContext::resolve_from(
            &exe_dir,
            &RuntimeConfig::default(),
            Platform::Windows,
        )
        .unwrap();
        assert_eq!(ctx.mode, RuntimeMode::Bundled);
        assert_eq!(ctx.plugin_dir, root.join("lib").join("gstreamer-1.0"));
        assert_eq!(ctx.scanner, Some(root.join("bin").join("gst-plugin-scanner.exe")));
        assert_eq!(ctx.registry, exe_dir.join("registry.bin"));
    }

    #[test]
    fn bundled_linux_layout_uses_plugins_dir() {
        let exe_dir = scratch("linux");
        let root = exe_dir.join("gstreamer");
        fs::create_dir_all(root.join("plugins")).unwrap();
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin").join("gst-plugin-scanner"), b"").unwrap();

        let ctx = EnvironmentContext::resolve_from(
            &exe_dir,
            &RuntimeConfig::default(),
            Platform::Linux,
        )
        .unwrap();
        assert_eq!(ctx.plugin_dir, root.join("plugins"));
        assert_eq!(ctx.scanner, Some(root.join("bin").join("gst-plugin-scanner")));
    }

    #[test]
    fn falls_back_to_configured_system_root() {
        let exe_dir = scratch("dev");
        let system = scratch("system");
        fs::create_dir_all(system.join("lib").join("gstreamer-1.0")).unwrap();

        let config = RuntimeConfig {
            system_root: Some(system.clone()),
            registry: Some(system.join("cache.bin")),
            ..RuntimeConfig::default()
        };
        let ctx = EnvironmentContext::resolve_from(&exe_dir, &config, Platform::Windows).unwrap();
        assert_eq!(ctx.mode, RuntimeMode::System);
        assert_eq!(ctx.root, system);
        assert_eq!(ctx.registry, system.join("cache.bin"));
        assert!(ctx.scanner.is_none());
    }

    #[test]
    fn multiarch_library_dir_is_a_system_root() {
        let libdir = scratch("multiarch");
        fs::create_dir_all(libdir.join("gstreamer-1.0")).unwrap();
        let (root, lib_dir) = system_root(&libdir, Platform::Linux).unwrap();
        assert_eq!(lib_dir, libdir);
        assert_eq!(Some(root.as_path()), libdir.parent());
        assert!(system_root(&libdir, Platform::Windows).is_none());
    }

    #[test]
    fn missing_runtime_is_reported() {
        let exe_dir = scratch("missing");
        let err = EnvironmentContext::resolve_from(
            &exe_dir,
            &config_without_system(),
            Platform::MacOs,
        )
        .unwrap_err();
        match err {
            CaptureError::RuntimeNotFound { searched } => {
                assert_eq!(searched[0], exe_dir.join("gstreamer"));
                assert!(searched.contains(&PathBuf::from("/nonexistent/camtap/runtime")));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
