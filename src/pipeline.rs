//! One camera, end to end.
//!
//! A running `CameraPipeline` has three workers:
//! - acquisition (`FrameSource`) publishing frames into a shared slot
//! - detect: every Nth new frame runs the engine, classifies detections in the tracker,
//!   enqueues new sightings and refreshes the annotated live frame
//! - process: pops sightings one at a time and hands them to the image store, the alert
//!   sink and the record store
//!
//! The queue is the only state crossing from detect to process. Stopping flips the run
//! flag; every worker exits at its next checkpoint without interrupting in-flight work.
//! Starting again joins the previous run's workers first, so a camera never has two
//! consumers on its queue.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::annotate::{Annotator, OverlayInfo};
use crate::detect::DetectionEngine;
use crate::frame::Frame;
use crate::ingest::{FrameSource, StreamConfig};
use crate::queue::{SightingEvent, SightingQueue, DEFAULT_QUEUE_CAPACITY};
use crate::sinks::{AlertSink, Delivery, ImageStore, SightingAlert};
use crate::storage::SharedRecordStore;
use crate::tracker::{
    Classification, DayRollover, QuantizationGrid, SightingTracker, DEFAULT_DETECTION_INTERVAL,
};
use crate::{join_within, sleep_while_running, RESTART_GRACE};

/// How long the process worker waits on an empty queue before re-checking the run flag.
const DEQUEUE_POLL: Duration = Duration::from_millis(250);
/// Pause after a failed inference call.
const DETECT_ERROR_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub stream: StreamConfig,
    pub confidence_threshold: f32,
    /// Cooldown before the same sighting key can be new again.
    pub detection_interval: Duration,
    /// Run detection on every Nth new frame.
    pub process_every_n_frames: u32,
    pub grid: QuantizationGrid,
    pub rollover: DayRollover,
    pub queue_capacity: usize,
    /// Detect loop poll period while no new frame is available.
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            confidence_threshold: 0.55,
            detection_interval: DEFAULT_DETECTION_INTERVAL,
            process_every_n_frames: 2,
            grid: QuantizationGrid::default(),
            rollover: DayRollover::Disabled,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: Duration::from_millis(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Running,
}

/// External collaborators shared by every pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub images: Arc<dyn ImageStore>,
    pub alerts: Arc<dyn AlertSink>,
    pub records: SharedRecordStore,
}

/// Point-in-time view of one pipeline, for health logging and the API.
#[derive(Clone, Debug, Serialize)]
pub struct PipelineStatus {
    pub camera_id: String,
    pub state: PipelineState,
    pub backend: &'static str,
    pub frames_captured: u64,
    pub decoder_restarts: u64,
    pub fps: u32,
    pub has_frame: bool,
    pub queue_depth: usize,
    pub queue_dropped: u64,
    pub tracked_keys: usize,
    pub sightings: u64,
}

// ----------------------------------------------------------------------------
// Detect stage
// ----------------------------------------------------------------------------

/// Outcome of running the detect stage on one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub detections: usize,
    pub new_sightings: usize,
}

/// Detect-and-classify step for one frame, shared with the detect worker.
#[derive(Clone)]
pub struct DetectStage {
    camera_id: String,
    threshold: f32,
    engine: Arc<Mutex<DetectionEngine>>,
    tracker: Arc<Mutex<SightingTracker>>,
    queue: Arc<SightingQueue>,
    annotator: Arc<Annotator>,
    annotated: Arc<Mutex<Option<Arc<Frame>>>>,
    sightings: Arc<AtomicU64>,
}

impl DetectStage {
    /// Detect on `frame`, classify each detection at the frame's capture time and
    /// enqueue one event per new sighting. Also refreshes the annotated live frame.
    pub fn process(&self, frame: &Arc<Frame>, fps: u32) -> Result<StageOutcome> {
        let detections = {
            let mut engine = self
                .engine
                .lock()
                .map_err(|_| anyhow!("detection engine lock poisoned"))?;
            engine.detect(frame, self.threshold)?
        };

        let mut events = Vec::new();
        {
            let mut tracker = self
                .tracker
                .lock()
                .map_err(|_| anyhow!("sighting tracker lock poisoned"))?;
            for detection in &detections {
                if tracker.classify(detection, frame.captured_at) == Classification::New {
                    events.push(SightingEvent {
                        camera_id: self.camera_id.clone(),
                        captured_at: frame.captured_at,
                        class: detection.class,
                        confidence: detection.confidence,
                        bbox: detection.bbox,
                        frame: frame.clone(),
                        key: tracker.key_for(detection),
                    });
                }
            }
        }

        let new_sightings = events.len();
        for event in events {
            log::info!(
                "[{}] new sighting {} ({:.0}%) key {}",
                self.camera_id,
                event.class,
                event.confidence * 100.0,
                event.key
            );
            self.queue.push(event);
        }
        self.sightings
            .fetch_add(new_sightings as u64, Ordering::Relaxed);

        let info = OverlayInfo {
            camera_id: self.camera_id.clone(),
            fps,
            new_sightings,
        };
        match self.annotator.annotate(frame, &detections, &info) {
            Ok(annotated) => {
                if let Ok(mut slot) = self.annotated.lock() {
                    *slot = Some(Arc::new(annotated));
                }
            }
            Err(err) => log::debug!("[{}] annotation skipped: {}", self.camera_id, err),
        }

        Ok(StageOutcome {
            detections: detections.len(),
            new_sightings,
        })
    }
}

// ----------------------------------------------------------------------------
// Downstream processing
// ----------------------------------------------------------------------------

/// What happened to one sighting downstream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub image_path: Option<String>,
    pub alerted: bool,
    pub record_id: Option<i64>,
}

/// Hands one sighting to the collaborators, in order: image, alerts, record.
/// Each failure is logged and does not stop the remaining steps.
#[derive(Clone)]
pub struct SightingProcessor {
    collaborators: Collaborators,
}

impl SightingProcessor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    pub fn process(&self, event: &SightingEvent) -> ProcessOutcome {
        let camera = event.camera_id.as_str();
        let mut outcome = ProcessOutcome::default();

        match self.collaborators.images.save(
            camera,
            event.captured_at,
            event.class,
            event.confidence,
            &event.frame,
        ) {
            Ok(path) => outcome.image_path = Some(path),
            Err(err) => log::warn!("[{}] failed to save sighting image: {:#}", camera, err),
        }

        let alert = SightingAlert {
            camera_id: event.camera_id.clone(),
            class: event.class,
            confidence: event.confidence,
            captured_at: event.captured_at,
        };
        let alerts = &self.collaborators.alerts;
        match alerts.notify(&alert) {
            Ok(Delivery::Sent) => {
                outcome.alerted = true;
                log::info!("[{}] {} alert sent", camera, alerts.name());
            }
            Ok(Delivery::Suppressed) => {}
            Err(err) => log::warn!("[{}] {} alert failed: {:#}", camera, alerts.name(), err),
        }
        if let Some(relative) = &outcome.image_path {
            let absolute: PathBuf = self.collaborators.images.resolve(relative);
            match alerts.notify_with_image(&absolute, &alert.caption()) {
                Ok(Delivery::Sent) => log::info!("[{}] {} photo sent", camera, alerts.name()),
                Ok(Delivery::Suppressed) => {}
                Err(err) => {
                    log::warn!("[{}] {} photo failed: {:#}", camera, alerts.name(), err)
                }
            }
        }

        let image_path = outcome.image_path.as_deref().unwrap_or("");
        let recorded = self
            .collaborators
            .records
            .lock()
            .map_err(|_| anyhow!("record store lock poisoned"))
            .and_then(|mut store| {
                store.record_sighting(camera, event.captured_at, event.confidence, image_path)
            });
        match recorded {
            Ok(id) => outcome.record_id = Some(id),
            Err(err) => log::warn!("[{}] failed to record sighting: {:#}", camera, err),
        }

        outcome
    }
}

// ----------------------------------------------------------------------------
// CameraPipeline
// ----------------------------------------------------------------------------

pub struct CameraPipeline {
    camera_id: String,
    config: PipelineConfig,
    source: FrameSource,
    backend: &'static str,
    stage: DetectStage,
    processor: SightingProcessor,
    running: Option<Arc<AtomicBool>>,
    workers: Vec<JoinHandle<()>>,
}

impl CameraPipeline {
    pub fn new(
        camera_id: impl Into<String>,
        config: PipelineConfig,
        engine: DetectionEngine,
        annotator: Arc<Annotator>,
        collaborators: Collaborators,
    ) -> Self {
        let camera_id = camera_id.into();
        let tracker = SightingTracker::new(config.grid, config.detection_interval)
            .with_rollover(config.rollover);
        let backend = engine.backend_name();
        let stage = DetectStage {
            camera_id: camera_id.clone(),
            threshold: config.confidence_threshold,
            engine: Arc::new(Mutex::new(engine)),
            tracker: Arc::new(Mutex::new(tracker)),
            queue: Arc::new(SightingQueue::new(config.queue_capacity)),
            annotator,
            annotated: Arc::new(Mutex::new(None)),
            sightings: Arc::new(AtomicU64::new(0)),
        };
        Self {
            source: FrameSource::new(camera_id.clone(), config.stream.clone()),
            camera_id,
            config,
            backend,
            stage,
            processor: SightingProcessor::new(collaborators),
            running: None,
            workers: Vec::new(),
        }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Stopped -> Running. A no-op when already running.
    pub fn start(&mut self) -> Result<()> {
        if self.state() == PipelineState::Running {
            return Ok(());
        }
        // The queue and frame slot take one consumer and one publisher; a stopped run's
        // workers must be joined before new ones attach.
        if !self.wait_stopped(RESTART_GRACE) {
            return Err(anyhow!(
                "[{}] workers from the previous run have not exited",
                self.camera_id
            ));
        }

        let stale = self.stage.queue.clear();
        if stale > 0 {
            log::info!("[{}] discarded {} sightings left from the last run", self.camera_id, stale);
        }

        self.source.start()?;
        let running = Arc::new(AtomicBool::new(true));

        let detect = DetectWorker {
            stage: self.stage.clone(),
            slot: self.source.slot(),
            stats: self.source.stats_handle(),
            running: running.clone(),
            every_n: self.config.process_every_n_frames.max(1),
            poll: self.config.poll_interval,
        };
        let process = ProcessWorker {
            camera_id: self.camera_id.clone(),
            processor: self.processor.clone(),
            queue: self.stage.queue.clone(),
            running: running.clone(),
        };

        let spawned = spawn_named(format!("detect:{}", self.camera_id), move || detect.run())
            .and_then(|detect| {
                let process =
                    spawn_named(format!("process:{}", self.camera_id), move || process.run())?;
                Ok([detect, process])
            });
        match spawned {
            Ok(handles) => self.workers.extend(handles),
            Err(err) => {
                running.store(false, Ordering::SeqCst);
                self.source.stop();
                return Err(err);
            }
        }

        self.running = Some(running);
        log::info!("[{}] pipeline started ({})", self.camera_id, self.backend);
        Ok(())
    }

    /// Running -> Stopped. Signals every worker and returns without waiting.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::SeqCst);
            log::info!("[{}] pipeline stopping", self.camera_id);
        }
        self.source.stop();
    }

    pub fn state(&self) -> PipelineState {
        match &self.running {
            Some(flag) if flag.load(Ordering::SeqCst) => PipelineState::Running,
            _ => PipelineState::Stopped,
        }
    }

    /// True when no worker of this pipeline is alive.
    pub fn is_finished(&self) -> bool {
        self.source.is_finished() && self.workers.iter().all(|h| h.is_finished())
    }

    /// Wait up to `timeout` for every worker to exit, joining them. Returns whether
    /// they all did.
    pub fn wait_stopped(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        join_within(&mut self.workers, timeout, &self.camera_id)
            && self
                .source
                .wait_stopped(deadline.saturating_duration_since(Instant::now()))
    }

    /// Latest annotated frame, else the latest raw frame, else none.
    pub fn live_frame(&self) -> Option<Arc<Frame>> {
        let annotated = self
            .stage
            .annotated
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        annotated.or_else(|| self.source.latest())
    }

    pub fn tracker_handle(&self) -> Arc<Mutex<SightingTracker>> {
        self.stage.tracker.clone()
    }

    pub fn queue(&self) -> Arc<SightingQueue> {
        self.stage.queue.clone()
    }

    /// The detect-and-classify step this pipeline's worker runs.
    pub fn detect_stage(&self) -> DetectStage {
        self.stage.clone()
    }

    pub fn processor(&self) -> SightingProcessor {
        self.processor.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        let stats = self.source.stats();
        let tracked_keys = self
            .stage
            .tracker
            .lock()
            .map(|tracker| tracker.len())
            .unwrap_or(0);
        PipelineStatus {
            camera_id: self.camera_id.clone(),
            state: self.state(),
            backend: self.backend,
            frames_captured: stats.frames_captured,
            decoder_restarts: stats.restarts,
            fps: stats.current_fps,
            has_frame: self.source.latest().is_some(),
            queue_depth: self.stage.queue.len(),
            queue_dropped: self.stage.queue.dropped(),
            tracked_keys,
            sightings: self.stage.sightings.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CameraPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| anyhow!("failed to spawn {}: {}", name, e))
}

// ----------------------------------------------------------------------------
// Workers
// ----------------------------------------------------------------------------

struct DetectWorker {
    stage: DetectStage,
    slot: Arc<crate::frame::FrameSlot>,
    stats: Arc<crate::ingest::SourceStats>,
    running: Arc<AtomicBool>,
    every_n: u32,
    poll: Duration,
}

impl DetectWorker {
    fn run(self) {
        let camera = self.stage.camera_id.clone();
        let mut last_sequence = 0u64;
        let mut new_frames = 0u64;

        while self.running.load(Ordering::SeqCst) {
            let frame = match self.slot.latest() {
                Some(frame) if frame.sequence != last_sequence => frame,
                _ => {
                    std::thread::sleep(self.poll);
                    continue;
                }
            };
            last_sequence = frame.sequence;
            new_frames += 1;
            if new_frames % u64::from(self.every_n) != 0 {
                continue;
            }

            let fps = self.stats.snapshot().current_fps;
            if let Err(err) = self.stage.process(&frame, fps) {
                log::warn!("[{}] detection failed: {:#}", camera, err);
                sleep_while_running(&self.running, DETECT_ERROR_BACKOFF);
            }
        }
        log::info!("[{}] detect loop stopped", camera);
    }
}

struct ProcessWorker {
    camera_id: String,
    processor: SightingProcessor,
    queue: Arc<SightingQueue>,
    running: Arc<AtomicBool>,
}

impl ProcessWorker {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            if let Some(event) = self.queue.pop_timeout(DEQUEUE_POLL) {
                self.processor.process(&event);
            }
        }
        log::info!("[{}] process loop stopped", self.camera_id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
