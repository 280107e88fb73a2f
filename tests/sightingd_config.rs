use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use sighting_kernel::config::{CameraSettings, SightingdConfig};
use sighting_kernel::detect::ObjectClass;
use sighting_kernel::tracker::DayRollover;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SIGHTING_CONFIG",
        "SIGHTING_API_ADDR",
        "SIGHTING_DB_PATH",
        "SIGHTING_IMAGES_DIR",
        "SIGHTING_CONFIDENCE",
        "SIGHTING_DETECTION_INTERVAL_SECS",
        "SIGHTING_TELEGRAM_TOKEN",
        "SIGHTING_TELEGRAM_CHAT_ID",
        "SIGHTING_CAMERAS",
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
        "db_path": "sightings_prod.db",
        "images_dir": "/var/lib/sightings",
        "api": { "addr": "0.0.0.0:9000" },
        "stream": { "width": 640, "height": 480, "frame_rate": 15 },
        "detection": {
            "confidence_threshold": 0.6,
            "detection_interval_secs": 120,
            "process_every_n_frames": 3
        },
        "tracker": { "position_bucket_px": 40, "rollover": "utc" },
        "queue": { "capacity": 8 },
        "alerts": { "telegram_bot_token": "token-from-file", "cooldown_secs": 45 },
        "cameras": [
            { "id": "Lobby", "url": "rtsp://cam-1/stream" },
            { "id": "Back Door", "url": "rtsp://cam-2/stream" }
        ]
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SIGHTING_CONFIG", file.path());
    std::env::set_var("SIGHTING_CONFIDENCE", "0.7");
    std::env::set_var("SIGHTING_TELEGRAM_CHAT_ID", "4242");

    let cfg = SightingdConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "sightings_prod.db");
    assert_eq!(cfg.images_dir.to_str(), Some("/var/lib/sightings"));
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!((cfg.stream.width, cfg.stream.height), (640, 480));
    assert_eq!(cfg.stream.frame_rate, 15);
    assert_eq!(cfg.detection.confidence_threshold, 0.7);
    assert_eq!(cfg.detection.detection_interval, Duration::from_secs(120));
    assert_eq!(cfg.detection.process_every_n_frames, 3);
    assert_eq!(cfg.tracker.grid.position_px, 40);
    assert_eq!(cfg.tracker.rollover, DayRollover::Utc);
    assert_eq!(cfg.queue_capacity, 8);
    assert_eq!(cfg.cameras.len(), 2);
    assert_eq!(cfg.cameras[1].id, "Back Door");

    let telegram = cfg.telegram().expect("telegram configured");
    assert_eq!(telegram.bot_token, "token-from-file");
    assert_eq!(telegram.chat_id, "4242");
    assert_eq!(telegram.cooldown, Duration::from_secs(45));

    let pipeline = cfg.pipeline_config(&cfg.cameras[0]);
    assert_eq!(pipeline.stream.url, "rtsp://cam-1/stream");
    assert_eq!(pipeline.stream.width, 640);
    assert_eq!(pipeline.queue_capacity, 8);
    assert_eq!(pipeline.process_every_n_frames, 3);

    clear_env();
}

#[test]
fn loads_toml_config_and_camera_list_from_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
        db_path = "from_toml.db"

        [detection]
        target_class = "vehicle"

        [[cameras]]
        id = "Yard"
        url = "stub://yard"
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("SIGHTING_CONFIG", file.path());
    std::env::set_var("SIGHTING_CAMERAS", "Front Gate=stub://front;Garage=stub://garage?fps=5");

    let cfg = SightingdConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "from_toml.db");
    assert_eq!(cfg.detection.target_class, ObjectClass::Vehicle);
    assert_eq!(
        cfg.cameras,
        vec![
            CameraSettings {
                id: "Front Gate".to_string(),
                url: "stub://front".to_string()
            },
            CameraSettings {
                id: "Garage".to_string(),
                url: "stub://garage?fps=5".to_string()
            },
        ]
    );

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SIGHTING_CONFIDENCE", "1.5");
    assert!(SightingdConfig::load().is_err());
    clear_env();

    std::env::set_var("SIGHTING_DETECTION_INTERVAL_SECS", "0");
    assert!(SightingdConfig::load().is_err());
    clear_env();

    std::env::set_var("SIGHTING_CAMERAS", "Lobby=stub://a;Lobby=stub://b");
    let err = SightingdConfig::load().unwrap_err();
    assert!(err.to_string().contains("duplicate camera id"));
    clear_env();

    std::env::set_var("SIGHTING_CAMERAS", " =stub://a");
    assert!(SightingdConfig::load().is_err());
    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SightingdConfig::load().expect("defaults");
    assert_eq!(cfg.db_path, "sightings.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.cameras.len(), 1);
    assert_eq!(cfg.cameras[0].id, "Front Gate");
    assert_eq!(cfg.tracker.rollover, DayRollover::Local);
    assert!(cfg.telegram().is_none());
}
