// Separate test binary: environment overrides are process wide.

use camtap::Config;

#[test]
fn environment_overrides_file_and_defaults() {
    std::env::set_var("CAMTAP__CAPTURE__FPS", "15");
    std::env::set_var("CAMTAP__CAPTURE__USE_GPU", "true");
    std::env::set_var("CAMTAP__PIPELINE__START_TIMEOUT_MS", "250");

    let config = Config::load(None).unwrap();
    assert_eq!(config.capture.fps, 15);
    assert!(config.capture.use_gpu);
    assert_eq!(config.pipeline.start_timeout_ms, 250);
    assert_eq!(config.capture.width, 640);
}
