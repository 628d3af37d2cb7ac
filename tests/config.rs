use std::io::Write;
use std::sync::Mutex;

use lenscast::{CameraSelector, CodecMode, Config, ProviderKind, Size};

// Environment overrides are process-wide
static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn missing_file_yields_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = tempfile::tempdir().unwrap();

    let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();

    assert_eq!(config.server.port, 4747);
    assert_eq!(config.capture.provider, ProviderKind::Virtual);
    assert_eq!(config.encoder.codec_mode, CodecMode::Software);
    assert_eq!(config.pipeline.queue_capacity, 1);
}

#[test]
fn file_values_override_defaults() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[server]
port = 5050

[capture]
camera = "front"
width = 1920
height = 1080

[encoder]
codec_mode = "hardware"
bitrate = 4000000
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path())).unwrap();
    let request = config.start_request();

    assert_eq!(request.port, 5050);
    assert_eq!(request.camera, CameraSelector::Front);
    assert_eq!(request.size, Size::new(1920, 1080));
    assert_eq!(request.codec_mode, CodecMode::Hardware);
    assert_eq!(request.bitrate, Some(4_000_000));
    // Untouched keys keep their defaults
    assert_eq!(request.fps, 30);
    assert_eq!(config.server.host, "0.0.0.0");
}

#[test]
fn environment_overrides_file() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[server]\nport = 5050").unwrap();

    std::env::set_var("LENSCAST_SERVER__PORT", "6060");
    let loaded = Config::load(Some(file.path()));
    std::env::remove_var("LENSCAST_SERVER__PORT");

    assert_eq!(loaded.unwrap().server.port, 6060);
}
