//! Fleet-wide control of camera pipelines.
//!
//! Owns one `CameraPipeline` per configured camera plus the tracker sweeper, which
//! expires stale sighting records on every camera at a fixed interval.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

use crate::annotate::Annotator;
use crate::config::SightingdConfig;
use crate::detect::{select_backend, DetectionEngine};
use crate::frame::Frame;
use crate::pipeline::{CameraPipeline, Collaborators, PipelineStatus};
use crate::sleep_while_running;
use crate::tracker::{SightingTracker, DEFAULT_RETENTION};

/// Default spacing between tracker sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);
/// Poll period while waiting for pipelines to wind down.
const STOP_POLL: Duration = Duration::from_millis(10);

type TrackerHandle = Arc<Mutex<SightingTracker>>;

pub struct FleetOrchestrator {
    pipelines: BTreeMap<String, Mutex<CameraPipeline>>,
    trackers: Vec<(String, TrackerHandle)>,
    retention: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<(Arc<AtomicBool>, JoinHandle<()>)>>,
}

impl FleetOrchestrator {
    /// Build a fleet from ready pipelines. Camera ids must be unique.
    pub fn new(
        pipelines: Vec<CameraPipeline>,
        retention: Duration,
        sweep_interval: Duration,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        let mut trackers = Vec::new();
        for pipeline in pipelines {
            let id = pipeline.camera_id().to_string();
            if map.contains_key(&id) {
                return Err(anyhow!("duplicate camera id '{}'", id));
            }
            trackers.push((id.clone(), pipeline.tracker_handle()));
            map.insert(id, Mutex::new(pipeline));
        }
        Ok(Self {
            pipelines: map,
            trackers,
            retention,
            sweep_interval,
            sweeper: Mutex::new(None),
        })
    }

    /// One pipeline per configured camera, each with its own detector backend.
    pub fn from_config(cfg: &SightingdConfig, collaborators: Collaborators) -> Result<Self> {
        let mut annotator = Annotator::new();
        if let Some(path) = &cfg.annotation.font_path {
            match Annotator::new().with_font_file(path) {
                Ok(with_font) => annotator = with_font,
                Err(err) => log::warn!("overlay labels disabled: {:#}", err),
            }
        }
        if let Some(brand) = &cfg.annotation.brand {
            annotator = annotator.with_brand(brand.clone());
        }
        let annotator = Arc::new(annotator);

        let backend_settings = cfg.backend_settings();
        let mut pipelines = Vec::with_capacity(cfg.cameras.len());
        for camera in &cfg.cameras {
            let backend = select_backend(&backend_settings)?;
            let engine = DetectionEngine::new(backend, cfg.detection.target_class)
                .with_max_detections(cfg.detection.max_detections);
            pipelines.push(CameraPipeline::new(
                camera.id.clone(),
                cfg.pipeline_config(camera),
                engine,
                annotator.clone(),
                collaborators.clone(),
            ));
        }
        Self::new(pipelines, cfg.tracker.retention, cfg.tracker.sweep_interval)
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    fn pipeline(&self, camera_id: &str) -> Result<&Mutex<CameraPipeline>> {
        self.pipelines
            .get(camera_id)
            .ok_or_else(|| anyhow!("unknown camera '{}'", camera_id))
    }

    fn with_pipeline<T>(
        &self,
        camera_id: &str,
        f: impl FnOnce(&mut CameraPipeline) -> T,
    ) -> Result<T> {
        let mut pipeline = self
            .pipeline(camera_id)?
            .lock()
            .map_err(|_| anyhow!("pipeline '{}' lock poisoned", camera_id))?;
        Ok(f(&mut pipeline))
    }

    pub fn start(&self, camera_id: &str) -> Result<()> {
        self.with_pipeline(camera_id, |p| p.start())?
    }

    pub fn stop(&self, camera_id: &str) -> Result<()> {
        self.with_pipeline(camera_id, |p| p.stop())
    }

    /// Start every pipeline and the sweeper. Cameras that fail to start are logged and
    /// skipped; returns how many are running.
    pub fn start_all(&self) -> Result<usize> {
        let mut started = 0;
        for id in self.pipelines.keys() {
            match self.start(id) {
                Ok(()) => started += 1,
                Err(err) => log::error!("[{}] failed to start: {:#}", id, err),
            }
        }
        self.start_sweeper()?;
        Ok(started)
    }

    /// Signal every pipeline and the sweeper to stop. Does not wait.
    pub fn stop_all(&self) -> Result<()> {
        for id in self.pipelines.keys() {
            self.stop(id)?;
        }
        let mut sweeper = self
            .sweeper
            .lock()
            .map_err(|_| anyhow!("sweeper lock poisoned"))?;
        if let Some((running, handle)) = sweeper.take() {
            running.store(false, Ordering::SeqCst);
            if handle.join().is_err() {
                log::error!("tracker sweeper panicked");
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for every pipeline's workers to exit.
    ///
    /// Each pipeline lock is held only for a quick check, so the API keeps serving
    /// status and frames while cameras wind down.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.pipelines.values().all(|pipeline| loop {
            let joined = match pipeline.lock() {
                Ok(mut p) => p.is_finished() && p.wait_stopped(Duration::ZERO),
                Err(_) => return false,
            };
            if joined {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(STOP_POLL);
        })
    }

    fn start_sweeper(&self) -> Result<()> {
        let mut sweeper = self
            .sweeper
            .lock()
            .map_err(|_| anyhow!("sweeper lock poisoned"))?;
        if sweeper.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let trackers = self.trackers.clone();
        let retention = self.retention;
        let interval = self.sweep_interval;
        let handle = std::thread::Builder::new()
            .name("tracker-sweep".to_string())
            .spawn(move || {
                while flag.load(Ordering::SeqCst) {
                    sleep_while_running(&flag, interval);
                    if !flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let expired = sweep_trackers(&trackers, Utc::now(), retention);
                    if expired > 0 {
                        log::info!("tracker sweep expired {} sighting records", expired);
                    }
                }
            })
            .map_err(|e| anyhow!("failed to spawn tracker sweeper: {}", e))?;
        *sweeper = Some((running, handle));
        Ok(())
    }

    /// Expire stale sighting records on every camera as of `now`.
    pub fn sweep_now(&self, now: DateTime<Utc>) -> usize {
        sweep_trackers(&self.trackers, now, self.retention)
    }

    /// Forget every tracked sighting on every camera.
    pub fn reset_all_tracking(&self) -> Result<()> {
        for (id, tracker) in &self.trackers {
            tracker
                .lock()
                .map_err(|_| anyhow!("[{}] tracker lock poisoned", id))?
                .reset_all();
        }
        log::info!("sighting tracking reset on {} cameras", self.trackers.len());
        Ok(())
    }

    pub fn status(&self) -> Vec<PipelineStatus> {
        self.pipelines
            .values()
            .filter_map(|pipeline| pipeline.lock().ok().map(|p| p.status()))
            .collect()
    }

    pub fn camera_status(&self, camera_id: &str) -> Result<PipelineStatus> {
        self.with_pipeline(camera_id, |p| p.status())
    }

    pub fn live_frame(&self, camera_id: &str) -> Result<Option<Arc<Frame>>> {
        self.with_pipeline(camera_id, |p| p.live_frame())
    }

    /// Live frame of one camera as JPEG, or `None` before its first frame.
    pub fn live_jpeg(&self, camera_id: &str, quality: u8) -> Result<Option<Vec<u8>>> {
        match self.live_frame(camera_id)? {
            Some(frame) => Ok(Some(frame.encode_jpeg(quality)?)),
            None => Ok(None),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

impl Default for FleetOrchestrator {
    fn default() -> Self {
        Self {
            pipelines: BTreeMap::new(),
            trackers: Vec::new(),
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            sweeper: Mutex::new(None),
        }
    }
}

impl Drop for FleetOrchestrator {
    fn drop(&mut self) {
        if let Err(err) = self.stop_all() {
            log::warn!("fleet shutdown: {:#}", err);
        }
    }
}

fn sweep_trackers(
    trackers: &[(String, TrackerHandle)],
    now: DateTime<Utc>,
    retention: Duration,
) -> usize {
    trackers
        .iter()
        .map(|(id, tracker)| match tracker.lock() {
            Ok(mut tracker) => tracker.expire_stale(now, retention),
            Err(_) => {
                log::error!("[{}] tracker lock poisoned; skipping sweep", id);
                0
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, ObjectClass, StubBackend};
    use crate::pipeline::PipelineConfig;
    use crate::sinks::{FilesystemImageStore, LogAlertSink};
    use crate::storage::{shared, InMemoryRecordStore};
    use chrono::TimeZone;

    fn pipeline(id: &str, dir: &std::path::Path) -> CameraPipeline {
        let detection = Detection::new(
            BoundingBox::new(100.0, 100.0, 180.0, 300.0),
            0.9,
            ObjectClass::Person,
        );
        CameraPipeline::new(
            id,
            PipelineConfig::default(),
            DetectionEngine::new(
                Box::new(StubBackend::repeating(vec![detection])),
                ObjectClass::Person,
            ),
            Arc::new(Annotator::new()),
            Collaborators {
                images: Arc::new(FilesystemImageStore::new(dir)),
                alerts: Arc::new(LogAlertSink),
                records: shared(InMemoryRecordStore::new()),
            },
        )
    }

    /// Alert sink that holds the downstream worker for `delay` on every alert.
    struct SlowSink {
        started: std::sync::atomic::AtomicUsize,
        delay: Duration,
    }

    impl crate::sinks::AlertSink for SlowSink {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn notify(&self, _alert: &crate::sinks::SightingAlert) -> Result<crate::sinks::Delivery> {
            self.started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(crate::sinks::Delivery::Sent)
        }

        fn notify_with_image(
            &self,
            _image_path: &std::path::Path,
            _caption: &str,
        ) -> Result<crate::sinks::Delivery> {
            Ok(crate::sinks::Delivery::Suppressed)
        }
    }

    fn frame(at: DateTime<Utc>) -> Arc<Frame> {
        Arc::new(Frame::rgb(vec![0; 640 * 480 * 3], 640, 480, at, 1).unwrap())
    }

    #[test]
    fn rejects_duplicate_camera_ids() {
        let dir = tempfile::tempdir().unwrap();
        let result = FleetOrchestrator::new(
            vec![pipeline("Lobby", dir.path()), pipeline("Lobby", dir.path())],
            DEFAULT_RETENTION,
            DEFAULT_SWEEP_INTERVAL,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_camera_is_an_error() {
        let fleet = FleetOrchestrator::default();
        assert!(fleet.start("nowhere").is_err());
        assert!(fleet.stop("nowhere").is_err());
        assert!(fleet.live_frame("nowhere").is_err());
    }

    #[test]
    fn waiting_for_shutdown_leaves_status_available() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(SlowSink {
            started: Default::default(),
            delay: Duration::from_millis(800),
        });
        let config = PipelineConfig {
            stream: crate::ingest::StreamConfig {
                url: "stub://lobby?fps=50".to_string(),
                width: 640,
                height: 480,
                restart_backoff: Duration::from_millis(10),
                ..Default::default()
            },
            process_every_n_frames: 1,
            ..PipelineConfig::default()
        };
        let detection = Detection::new(
            BoundingBox::new(100.0, 100.0, 180.0, 300.0),
            0.9,
            ObjectClass::Person,
        );
        let lobby = CameraPipeline::new(
            "Lobby",
            config,
            DetectionEngine::new(
                Box::new(StubBackend::repeating(vec![detection])),
                ObjectClass::Person,
            ),
            Arc::new(Annotator::new()),
            Collaborators {
                images: Arc::new(FilesystemImageStore::new(dir.path())),
                alerts: sink.clone(),
                records: shared(InMemoryRecordStore::new()),
            },
        );
        let fleet = Arc::new(FleetOrchestrator::new(
            vec![lobby],
            DEFAULT_RETENTION,
            DEFAULT_SWEEP_INTERVAL,
        )?);

        fleet.start_all()?;
        let deadline = Instant::now() + Duration::from_secs(10);
        while sink.started.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);

        // The downstream worker is inside the slow alert; shutdown takes a while.
        fleet.stop_all()?;
        let waiting = fleet.clone();
        let waiter = std::thread::spawn(move || waiting.wait_stopped(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));

        let asked = Instant::now();
        let statuses = fleet.status();
        assert!(asked.elapsed() < Duration::from_millis(300));
        assert_eq!(statuses.len(), 1);
        assert!(!waiter.is_finished());

        assert!(waiter.join().unwrap());
        assert!(fleet.wait_stopped(Duration::ZERO));
        Ok(())
    }

    #[test]
    fn sweep_and_reset_reach_every_camera() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lobby = pipeline("Lobby", dir.path());
        let gate = pipeline("Gate", dir.path());
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        lobby.detect_stage().process(&frame(t0), 0)?;
        gate.detect_stage()
            .process(&frame(t0 + chrono::Duration::minutes(50)), 0)?;

        let fleet =
            FleetOrchestrator::new(vec![lobby, gate], Duration::from_secs(3600), DEFAULT_SWEEP_INTERVAL)?;
        assert_eq!(fleet.camera_ids(), vec!["Gate".to_string(), "Lobby".to_string()]);

        // Lobby's record is 70 minutes idle, Gate's only 20.
        assert_eq!(fleet.sweep_now(t0 + chrono::Duration::minutes(70)), 1);
        assert_eq!(fleet.camera_status("Lobby")?.tracked_keys, 0);
        assert_eq!(fleet.camera_status("Gate")?.tracked_keys, 1);

        fleet.reset_all_tracking()?;
        assert!(fleet.status().iter().all(|s| s.tracked_keys == 0));
        Ok(())
    }
}
