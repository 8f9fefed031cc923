// Separate test binary: `register` writes process-wide variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use camtap::capture::Platform;
use camtap::{EnvironmentContext, RuntimeConfig, RuntimeMode};

fn scratch(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("camtap-register-{}-{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn var(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn first_on_path() -> Option<PathBuf> {
    env::split_paths(&env::var_os("PATH")?).next()
}

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"").unwrap();
}

#[test]
fn register_exports_loader_variables() {
    env::remove_var("GST_PLUGIN_SYSTEM_PATH");

    // System install: system plugin path is left to GStreamer
    let root = scratch("system");
    let system = EnvironmentContext {
        mode: RuntimeMode::System,
        root: root.clone(),
        bin_dir: root.join("bin"),
        lib_dir: root.join("lib"),
        plugin_dir: root.join("lib").join("gstreamer-1.0"),
        scanner: Some(root.join("libexec").join("gst-plugin-scanner")),
        registry: root.join("registry.bin"),
    };
    fs::create_dir_all(&system.bin_dir).unwrap();
    system.register();

    assert_eq!(var("GST_PLUGIN_PATH"), Some(system.plugin_dir.clone()));
    assert_eq!(var("GST_REGISTRY"), Some(system.registry.clone()));
    assert_eq!(var("GST_PLUGIN_SCANNER"), system.scanner.clone());
    assert_eq!(var("GST_PLUGIN_SYSTEM_PATH"), None);
    assert_eq!(first_on_path(), Some(system.bin_dir.clone()));

    // Bundle next to the executable: system plugins are shut out
    let exe_dir = scratch("bundled");
    let bundle = exe_dir.join("gstreamer");
    fs::create_dir_all(bundle.join("lib").join("gstreamer-1.0")).unwrap();
    touch(&bundle.join("bin").join("gst-plugin-scanner"));

    let bundled =
        EnvironmentContext::resolve_from(&exe_dir, &RuntimeConfig::default(), Platform::Linux)
            .unwrap();
    assert_eq!(bundled.mode, RuntimeMode::Bundled);
    bundled.register();

    let plugins = bundle.join("lib").join("gstreamer-1.0");
    assert_eq!(var("GST_PLUGIN_PATH"), Some(plugins.clone()));
    assert_eq!(var("GST_PLUGIN_SYSTEM_PATH"), Some(plugins));
    assert_eq!(var("GST_REGISTRY"), Some(exe_dir.join("registry.bin")));
    assert_eq!(
        var("GST_PLUGIN_SCANNER"),
        Some(bundle.join("bin").join("gst-plugin-scanner"))
    );
    assert_eq!(first_on_path(), Some(bundle.join("bin")));

    let _ = fs::remove_dir_all(&root);
    let _ = fs::remove_dir_all(&exe_dir);
}
