use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use sentinela::config::BackendKind;
use sentinela::{AlertKind, CameraId, SentinelConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SENTINEL_CONFIG",
        "SENTINEL_STORE_PATH",
        "SENTINEL_BOT_TOKEN",
        "SENTINEL_CAMERAS",
        "SENTINEL_MODEL_PATH",
        "SENTINEL_MEDIA_DIR",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "store_path": "/var/lib/sentinela/memory.json",
        "bot": { "token": "file-token", "poll_timeout_secs": 20 },
        "cameras": [
            { "id": 1, "url": "rtsp://10.0.0.5/live" },
            { "id": 2, "url": "http://10.0.0.6/mjpeg", "target_fps": 5 }
        ],
        "capture": { "decimation": 3, "reconnect_backoff_ms": 500 },
        "debounce": { "threshold": 4, "interval_ms": 1500 },
        "rate": { "max_per_minute": 10 },
        "alert_kind": "photo"
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SENTINEL_CONFIG", file.path());
    std::env::set_var("SENTINEL_BOT_TOKEN", "env-token");
    std::env::set_var("SENTINEL_MEDIA_DIR", "/tmp/sentinela-media");

    let cfg = SentinelConfig::load(None).expect("load config");

    assert_eq!(cfg.store_path, PathBuf::from("/var/lib/sentinela/memory.json"));
    assert_eq!(cfg.bot.token.as_deref(), Some("env-token"));
    assert_eq!(cfg.bot.poll_timeout, Duration::from_secs(20));
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.capture.decimation, 3);
    assert_eq!(cfg.capture.reconnect_backoff, Duration::from_millis(500));
    assert_eq!(cfg.debounce.threshold, 4);
    assert_eq!(cfg.rate.max_per_minute, 10);
    assert_eq!(cfg.rate.min_interval, Duration::from_secs(3));
    assert_eq!(cfg.alert_kind, AlertKind::Photo);
    assert_eq!(cfg.video.output_dir, PathBuf::from("/tmp/sentinela-media"));

    let sources = cfg.source_configs();
    assert_eq!(sources[0].target_fps, 10);
    assert_eq!(sources[1].target_fps, 5);
    assert_eq!(cfg.pipeline_settings().worker.decimation, 3);

    clear_env();
}

#[test]
fn camera_list_and_model_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var(
        "SENTINEL_CAMERAS",
        "3=rtsp://user:pw@gate/stream, stub://yard?mode=flaky",
    );
    std::env::set_var("SENTINEL_MODEL_PATH", "/models/yolov8n.onnx");

    let cfg = SentinelConfig::load(None).expect("load config");

    let ids: Vec<CameraId> = cfg.cameras.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![CameraId(3), CameraId(2)]);
    assert_eq!(cfg.cameras[1].url, "stub://yard?mode=flaky");
    assert_eq!(cfg.model.backend, BackendKind::Tract);
    assert_eq!(cfg.model.path, Some(PathBuf::from("/models/yolov8n.onnx")));

    clear_env();
}

#[test]
fn toml_files_are_accepted_and_validated() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("sentinela.toml");
    std::fs::write(
        &path,
        r#"
store_path = "memory.json"

[[cameras]]
id = 4
url = "stub://porch"

[model]
confidence_threshold = 0.65
"#,
    )
    .expect("write config");

    let cfg = SentinelConfig::load(Some(&path)).expect("load toml config");
    assert_eq!(cfg.cameras[0].id, CameraId(4));
    assert!((cfg.model.confidence_threshold - 0.65).abs() < 1e-6);

    std::fs::write(
        &path,
        r#"
[model]
confidence_threshold = 1.5
"#,
    )
    .expect("rewrite config");
    assert!(SentinelConfig::load(Some(&path)).is_err());

    std::fs::write(
        &path,
        r#"
[[cameras]]
id = 1
url = "stub://a"

[[cameras]]
id = 1
url = "stub://b"
"#,
    )
    .expect("rewrite config");
    assert!(SentinelConfig::load(Some(&path)).is_err());

    clear_env();
}
