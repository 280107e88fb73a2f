use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::detect::{BackendKind, BackendSettings, ObjectClass, DEFAULT_MAX_DETECTIONS};
use crate::ingest::StreamConfig;
use crate::pipeline::PipelineConfig;
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::sinks::TelegramSettings;
use crate::tracker::{
    DayRollover, QuantizationGrid, DEFAULT_AREA_BUCKET_PX2, DEFAULT_POSITION_BUCKET_PX,
};

const DEFAULT_DB_PATH: &str = "sightings.db";
const DEFAULT_IMAGES_DIR: &str = "images";
const DEFAULT_API_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_CAMERA_ID: &str = "Front Gate";
const DEFAULT_CAMERA_URL: &str = "stub://front_gate";
const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 720;
const DEFAULT_FRAME_RATE: u32 = 30;
const DEFAULT_HISTORY: usize = 5;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 1000;
const DEFAULT_RTSP_TRANSPORT: &str = "tcp";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_CONFIDENCE: f32 = 0.55;
const DEFAULT_DETECTION_INTERVAL_SECS: u64 = 180;
const DEFAULT_EVERY_N_FRAMES: u32 = 2;
const DEFAULT_RETENTION_SECS: u64 = 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 30;
const DEFAULT_ALERT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PHOTO_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize, Default)]
struct SightingdConfigFile {
    db_path: Option<String>,
    images_dir: Option<PathBuf>,
    api: Option<ApiConfigFile>,
    stream: Option<StreamConfigFile>,
    detection: Option<DetectionConfigFile>,
    tracker: Option<TrackerConfigFile>,
    queue: Option<QueueConfigFile>,
    alerts: Option<AlertsConfigFile>,
    annotation: Option<AnnotationConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    frame_rate: Option<u32>,
    history: Option<usize>,
    restart_backoff_ms: Option<u64>,
    rtsp_transport: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    iou_threshold: Option<f32>,
    target_class: Option<String>,
    confidence_threshold: Option<f32>,
    detection_interval_secs: Option<u64>,
    process_every_n_frames: Option<u32>,
    max_detections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    position_bucket_px: Option<u32>,
    area_bucket_px2: Option<u32>,
    retention_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    rollover: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct QueueConfigFile {
    capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsConfigFile {
    enabled: Option<bool>,
    telegram_bot_token: Option<String>,
    telegram_chat_id: Option<String>,
    cooldown_secs: Option<u64>,
    timeout_secs: Option<u64>,
    photo_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AnnotationConfigFile {
    font_path: Option<PathBuf>,
    brand: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    url: String,
}

#[derive(Debug, Clone)]
pub struct SightingdConfig {
    pub db_path: String,
    pub images_dir: PathBuf,
    pub api_addr: String,
    pub stream: StreamSettings,
    pub detection: DetectionSettings,
    pub tracker: TrackerSettings,
    pub queue_capacity: usize,
    pub alerts: AlertSettings,
    pub annotation: AnnotationSettings,
    pub cameras: Vec<CameraSettings>,
}

/// Decode parameters shared by every camera.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub history: usize,
    pub restart_backoff: Duration,
    pub rtsp_transport: String,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: BackendKind,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub iou_threshold: f32,
    pub target_class: ObjectClass,
    pub confidence_threshold: f32,
    pub detection_interval: Duration,
    pub process_every_n_frames: u32,
    pub max_detections: usize,
}

#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub grid: QuantizationGrid,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub rollover: DayRollover,
}

#[derive(Debug, Clone)]
pub struct AlertSettings {
    pub enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub cooldown: Duration,
    pub timeout: Duration,
    pub photo_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationSettings {
    pub font_path: Option<PathBuf>,
    pub brand: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub id: String,
    pub url: String,
}

impl SightingdConfig {
    /// Load from the file named by `SIGHTING_CONFIG` (if any), then env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SIGHTING_CONFIG").ok();
        Self::load_from(
            config_path
                .as_deref()
                .filter(|path| !path.trim().is_empty())
                .map(Path::new),
        )
    }

    /// Load from an explicit file (or defaults), then env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SightingdConfigFile) -> Result<Self> {
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            width: stream_file.width.unwrap_or(DEFAULT_WIDTH),
            height: stream_file.height.unwrap_or(DEFAULT_HEIGHT),
            frame_rate: stream_file.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            history: stream_file.history.unwrap_or(DEFAULT_HISTORY),
            restart_backoff: Duration::from_millis(
                stream_file
                    .restart_backoff_ms
                    .unwrap_or(DEFAULT_RESTART_BACKOFF_MS),
            ),
            rtsp_transport: stream_file
                .rtsp_transport
                .unwrap_or_else(|| DEFAULT_RTSP_TRANSPORT.to_string()),
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            backend: detection_file
                .backend
                .as_deref()
                .unwrap_or("auto")
                .parse()?,
            model_path: detection_file.model_path,
            input_size: detection_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            iou_threshold: detection_file
                .iou_threshold
                .unwrap_or(DEFAULT_IOU_THRESHOLD),
            target_class: detection_file
                .target_class
                .as_deref()
                .unwrap_or("person")
                .parse()?,
            confidence_threshold: detection_file
                .confidence_threshold
                .unwrap_or(DEFAULT_CONFIDENCE),
            detection_interval: Duration::from_secs(
                detection_file
                    .detection_interval_secs
                    .unwrap_or(DEFAULT_DETECTION_INTERVAL_SECS),
            ),
            process_every_n_frames: detection_file
                .process_every_n_frames
                .unwrap_or(DEFAULT_EVERY_N_FRAMES),
            max_detections: detection_file
                .max_detections
                .unwrap_or(DEFAULT_MAX_DETECTIONS),
        };

        let tracker_file = file.tracker.unwrap_or_default();
        let tracker = TrackerSettings {
            grid: QuantizationGrid {
                position_px: tracker_file
                    .position_bucket_px
                    .unwrap_or(DEFAULT_POSITION_BUCKET_PX),
                area_px2: tracker_file
                    .area_bucket_px2
                    .unwrap_or(DEFAULT_AREA_BUCKET_PX2),
            },
            retention: Duration::from_secs(
                tracker_file.retention_secs.unwrap_or(DEFAULT_RETENTION_SECS),
            ),
            sweep_interval: Duration::from_secs(
                tracker_file
                    .sweep_interval_secs
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            rollover: match tracker_file.rollover.as_deref() {
                Some(policy) => policy.parse()?,
                None => DayRollover::default(),
            },
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            enabled: alerts_file.enabled.unwrap_or(true),
            telegram_bot_token: alerts_file.telegram_bot_token,
            telegram_chat_id: alerts_file.telegram_chat_id,
            cooldown: Duration::from_secs(
                alerts_file
                    .cooldown_secs
                    .unwrap_or(DEFAULT_ALERT_COOLDOWN_SECS),
            ),
            timeout: Duration::from_secs(
                alerts_file.timeout_secs.unwrap_or(DEFAULT_ALERT_TIMEOUT_SECS),
            ),
            photo_timeout: Duration::from_secs(
                alerts_file
                    .photo_timeout_secs
                    .unwrap_or(DEFAULT_PHOTO_TIMEOUT_SECS),
            ),
        };

        let annotation = file
            .annotation
            .map(|a| AnnotationSettings {
                font_path: a.font_path,
                brand: a.brand,
            })
            .unwrap_or_default();

        let cameras = match file.cameras {
            Some(cameras) => cameras
                .into_iter()
                .map(|c| CameraSettings { id: c.id, url: c.url })
                .collect(),
            None => vec![CameraSettings {
                id: DEFAULT_CAMERA_ID.to_string(),
                url: DEFAULT_CAMERA_URL.to_string(),
            }],
        };

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            images_dir: file
                .images_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGES_DIR)),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            stream,
            detection,
            tracker,
            queue_capacity: file
                .queue
                .and_then(|q| q.capacity)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),
            alerts,
            annotation,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = non_empty_env("SIGHTING_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = non_empty_env("SIGHTING_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = non_empty_env("SIGHTING_IMAGES_DIR") {
            self.images_dir = PathBuf::from(dir);
        }
        if let Some(value) = non_empty_env("SIGHTING_CONFIDENCE") {
            self.detection.confidence_threshold = value
                .parse()
                .map_err(|_| anyhow!("SIGHTING_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Some(value) = non_empty_env("SIGHTING_DETECTION_INTERVAL_SECS") {
            let seconds: u64 = value.parse().map_err(|_| {
                anyhow!("SIGHTING_DETECTION_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.detection.detection_interval = Duration::from_secs(seconds);
        }
        if let Some(token) = non_empty_env("SIGHTING_TELEGRAM_TOKEN") {
            self.alerts.telegram_bot_token = Some(token);
        }
        if let Some(chat) = non_empty_env("SIGHTING_TELEGRAM_CHAT_ID") {
            self.alerts.telegram_chat_id = Some(chat);
        }
        if let Some(cameras) = non_empty_env("SIGHTING_CAMERAS") {
            self.cameras = parse_camera_list(&cameras)?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow!(
                "confidence threshold must be within [0, 1], got {}",
                threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(anyhow!("iou threshold must be within [0, 1]"));
        }
        if self.detection.detection_interval.is_zero() {
            return Err(anyhow!("detection interval must be greater than zero"));
        }
        if self.detection.process_every_n_frames == 0 {
            return Err(anyhow!("process_every_n_frames must be greater than zero"));
        }
        if self.detection.max_detections == 0 || self.detection.input_size == 0 {
            return Err(anyhow!("max_detections and input_size must be greater than zero"));
        }
        if self.tracker.retention.is_zero() {
            return Err(anyhow!("tracker retention must be greater than zero"));
        }
        if self.tracker.sweep_interval.is_zero() {
            return Err(anyhow!("sweep interval must be greater than zero"));
        }
        if self.tracker.grid.position_px == 0 || self.tracker.grid.area_px2 == 0 {
            return Err(anyhow!("tracker bucket sizes must be greater than zero"));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be greater than zero"));
        }
        if self.stream.width == 0 || self.stream.height == 0 || self.stream.frame_rate == 0 {
            return Err(anyhow!("stream width, height and frame_rate must be non-zero"));
        }
        if self.stream.history == 0 {
            return Err(anyhow!("stream history must hold at least one frame"));
        }

        let mut seen = HashSet::new();
        for camera in &mut self.cameras {
            camera.id = camera.id.trim().to_string();
            if camera.id.is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if camera.url.trim().is_empty() {
                return Err(anyhow!("camera '{}' has no stream url", camera.id));
            }
            if !seen.insert(camera.id.clone()) {
                return Err(anyhow!("duplicate camera id '{}'", camera.id));
            }
        }
        Ok(())
    }

    /// Telegram settings when alerts are enabled and both credentials are present.
    pub fn telegram(&self) -> Option<TelegramSettings> {
        if !self.alerts.enabled {
            return None;
        }
        let token = self.alerts.telegram_bot_token.as_ref()?;
        let chat = self.alerts.telegram_chat_id.as_ref()?;
        let mut settings = TelegramSettings::new(token.clone(), chat.clone());
        settings.cooldown = self.alerts.cooldown;
        settings.message_timeout = self.alerts.timeout;
        settings.photo_timeout = self.alerts.photo_timeout;
        Some(settings)
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            kind: self.detection.backend,
            model_path: self.detection.model_path.clone(),
            input_size: self.detection.input_size,
            iou_threshold: self.detection.iou_threshold,
        }
    }

    /// Per-camera pipeline parameters.
    pub fn pipeline_config(&self, camera: &CameraSettings) -> PipelineConfig {
        PipelineConfig {
            stream: StreamConfig {
                url: camera.url.clone(),
                width: self.stream.width,
                height: self.stream.height,
                frame_rate: self.stream.frame_rate,
                history: self.stream.history,
                restart_backoff: self.stream.restart_backoff,
                rtsp_transport: self.stream.rtsp_transport.clone(),
            },
            confidence_threshold: self.detection.confidence_threshold,
            detection_interval: self.detection.detection_interval,
            process_every_n_frames: self.detection.process_every_n_frames,
            grid: self.tracker.grid,
            rollover: self.tracker.rollover,
            queue_capacity: self.queue_capacity,
            ..PipelineConfig::default()
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<SightingdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

/// Parse `id=url;id=url`. The first `=` separates id from url.
fn parse_camera_list(value: &str) -> Result<Vec<CameraSettings>> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, url) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("camera entry '{}' must look like id=url", entry))?;
            Ok(CameraSettings {
                id: id.trim().to_string(),
                url: url.trim().to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn camera_list_splits_on_first_equals() {
        let cameras =
            parse_camera_list("Lobby=stub://lobby?fps=5; Gate 2 = rtsp://cam/ch1?a=b ;").unwrap();
        assert_eq!(
            cameras,
            vec![
                CameraSettings {
                    id: "Lobby".into(),
                    url: "stub://lobby?fps=5".into()
                },
                CameraSettings {
                    id: "Gate 2".into(),
                    url: "rtsp://cam/ch1?a=b".into()
                },
            ]
        );
        assert!(parse_camera_list("no-url-here").is_err());
    }

    #[test]
    fn defaults_match_deployment_values() {
        let mut cfg = SightingdConfig::from_file(SightingdConfigFile::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.api_addr, "127.0.0.1:5000");
        assert_eq!((cfg.stream.width, cfg.stream.height), (1280, 720));
        assert_eq!(cfg.detection.confidence_threshold, 0.55);
        assert_eq!(cfg.detection.detection_interval, Duration::from_secs(180));
        assert_eq!(cfg.detection.process_every_n_frames, 2);
        assert_eq!(cfg.tracker.retention, Duration::from_secs(3600));
        assert_eq!(cfg.tracker.sweep_interval, Duration::from_secs(300));
        assert_eq!(cfg.queue_capacity, 32);
        assert_eq!(cfg.cameras.len(), 1);
        assert!(cfg.telegram().is_none());
    }
}
