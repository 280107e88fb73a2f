use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use sighting_kernel::detect::{BoundingBox, CpuBackend, Detection, ObjectClass, StubBackend};
use sighting_kernel::ingest::StreamConfig;
use sighting_kernel::pipeline::{
    CameraPipeline, Collaborators, PipelineConfig, PipelineState, StageOutcome,
};
use sighting_kernel::queue::SightingEvent;
use sighting_kernel::sinks::{AlertSink, Delivery, SightingAlert};
use sighting_kernel::storage::{shared, InMemoryRecordStore, RecordStore, SharedRecordStore};
use sighting_kernel::tracker::QuantizationGrid;
use sighting_kernel::{
    Annotator, DetectionEngine, FilesystemImageStore, FleetOrchestrator, Frame, LogAlertSink,
};

struct Harness {
    dir: TempDir,
    records: SharedRecordStore,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            records: shared(InMemoryRecordStore::new()),
        }
    }

    fn collaborators(&self) -> Collaborators {
        self.collaborators_with(Arc::new(LogAlertSink))
    }

    fn collaborators_with(&self, alerts: Arc<dyn AlertSink>) -> Collaborators {
        Collaborators {
            images: Arc::new(FilesystemImageStore::new(self.dir.path())),
            alerts,
            records: self.records.clone(),
        }
    }

    fn recorded(&self) -> usize {
        self.records.lock().unwrap().recent(1000).unwrap().len()
    }
}

/// Alert sink that notes which thread delivered each alert and how many overlapped.
#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(ThreadId, DateTime<Utc>)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingSink {
    fn delivered(&self) -> Vec<(ThreadId, DateTime<Utc>)> {
        self.delivered.lock().unwrap().clone()
    }

    fn threads(&self) -> HashSet<ThreadId> {
        self.delivered().into_iter().map(|(thread, _)| thread).collect()
    }
}

impl AlertSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn notify(&self, alert: &SightingAlert) -> anyhow::Result<Delivery> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        self.delivered
            .lock()
            .unwrap()
            .push((std::thread::current().id(), alert.captured_at));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Delivery::Sent)
    }

    fn notify_with_image(&self, _image_path: &Path, _caption: &str) -> anyhow::Result<Delivery> {
        Ok(Delivery::Suppressed)
    }
}

/// Event from `producer`, its `index`-th, tagged through the capture time.
fn tagged_event(producer: i64, index: i64) -> SightingEvent {
    let at = base_time() + chrono::Duration::seconds(producer * 1000 + index);
    let detection = person(10.0, 10.0, 30.0, 60.0, 0.9);
    SightingEvent {
        camera_id: "Dock".to_string(),
        captured_at: at,
        class: ObjectClass::Person,
        confidence: detection.confidence,
        bbox: detection.bbox,
        frame: Arc::new(Frame::rgb(vec![40; 32 * 24 * 3], 32, 24, at, 1).unwrap()),
        key: QuantizationGrid::default().key_for(&detection.bbox),
    }
}

fn tag_of(at: DateTime<Utc>) -> (i64, i64) {
    let seconds = (at - base_time()).num_seconds();
    (seconds / 1000, seconds % 1000)
}

fn quiet_pipeline(
    config: PipelineConfig,
    harness: &Harness,
    sink: Arc<RecordingSink>,
) -> CameraPipeline {
    CameraPipeline::new(
        "Dock",
        config,
        DetectionEngine::new(Box::new(StubBackend::new()), ObjectClass::Person),
        Arc::new(Annotator::new()),
        harness.collaborators_with(sink),
    )
}

fn person(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> Detection {
    Detection::new(BoundingBox::new(x1, y1, x2, y2), confidence, ObjectClass::Person)
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 14, 12, 0, 0).unwrap()
}

fn frame_at(seconds: i64, sequence: u64) -> Arc<Frame> {
    let at = base_time() + chrono::Duration::seconds(seconds);
    Arc::new(Frame::rgb(vec![40; 640 * 480 * 3], 640, 480, at, sequence).unwrap())
}

fn stub_pipeline(
    id: &str,
    backend: StubBackend,
    config: PipelineConfig,
    harness: &Harness,
) -> CameraPipeline {
    CameraPipeline::new(
        id,
        config,
        DetectionEngine::new(Box::new(backend), ObjectClass::Person),
        Arc::new(Annotator::new()),
        harness.collaborators(),
    )
}

fn stub_stream(name: &str) -> StreamConfig {
    StreamConfig {
        url: format!("stub://{}?fps=60", name),
        width: 160,
        height: 120,
        frame_rate: 60,
        restart_backoff: Duration::from_millis(10),
        ..StreamConfig::default()
    }
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn standing_person_produces_one_sighting_per_interval() {
    let harness = Harness::new();
    // The same person drifts by a pixel or two between frames.
    let backend = StubBackend::scripted(vec![
        vec![person(100.0, 100.0, 180.0, 300.0, 0.91)],
        vec![person(101.0, 100.0, 181.0, 301.0, 0.90)],
        vec![person(100.0, 100.0, 181.0, 300.0, 0.92)],
        vec![person(101.3, 100.0, 181.0, 301.0, 0.89)],
        vec![person(100.0, 100.0, 180.0, 300.0, 0.93)],
        vec![person(100.0, 100.0, 180.0, 300.0, 0.90)],
    ]);
    let pipeline = stub_pipeline("Lobby", backend, PipelineConfig::default(), &harness);
    let stage = pipeline.detect_stage();

    let mut new_sightings = 0;
    for (i, seconds) in [0, 5, 10, 15, 20].into_iter().enumerate() {
        let outcome = stage.process(&frame_at(seconds, i as u64 + 1), 0).unwrap();
        assert_eq!(outcome.detections, 1);
        new_sightings += outcome.new_sightings;
    }
    assert_eq!(new_sightings, 1);

    // Past the 180 s detection interval the same spot is new again.
    let later = stage.process(&frame_at(220, 6), 0).unwrap();
    assert_eq!(later, StageOutcome { detections: 1, new_sightings: 1 });

    let queue = pipeline.queue();
    assert_eq!(queue.len(), 2);
    let first = queue.try_pop().unwrap();
    let second = queue.try_pop().unwrap();
    assert_eq!(first.camera_id, "Lobby");
    assert_eq!(first.captured_at, base_time());
    assert_eq!(second.captured_at, base_time() + chrono::Duration::seconds(220));
    assert_eq!(first.key, second.key);
}

#[test]
fn detections_below_threshold_or_other_classes_are_ignored() {
    let harness = Harness::new();
    let backend = StubBackend::repeating(vec![
        person(10.0, 10.0, 60.0, 120.0, 0.40),
        Detection::new(
            BoundingBox::new(300.0, 200.0, 420.0, 260.0),
            0.95,
            ObjectClass::Vehicle,
        ),
    ]);
    let pipeline = stub_pipeline("Gate", backend, PipelineConfig::default(), &harness);
    let outcome = pipeline.detect_stage().process(&frame_at(0, 1), 0).unwrap();
    assert_eq!(outcome, StageOutcome::default());
    assert!(pipeline.queue().is_empty());
}

#[test]
fn sightings_are_processed_in_fifo_order() {
    let harness = Harness::new();
    let backend = StubBackend::scripted(vec![
        vec![person(0.0, 0.0, 40.0, 80.0, 0.9)],
        vec![person(200.0, 0.0, 240.0, 80.0, 0.8)],
        vec![person(400.0, 0.0, 440.0, 80.0, 0.7)],
    ]);
    let pipeline = stub_pipeline("Dock", backend, PipelineConfig::default(), &harness);
    let stage = pipeline.detect_stage();
    for i in 0..3 {
        stage.process(&frame_at(i, i as u64 + 1), 0).unwrap();
    }

    let processor = pipeline.processor();
    let queue = pipeline.queue();
    let mut ids = Vec::new();
    while let Some(event) = queue.try_pop() {
        let outcome = processor.process(&event);
        ids.push(outcome.record_id.expect("recorded"));
        assert!(outcome.image_path.is_some());
    }
    assert_eq!(ids, vec![1, 2, 3]);

    let rows = harness.records.lock().unwrap().recent_for_camera("Dock", 10).unwrap();
    let confidences: Vec<f64> = rows.iter().map(|r| r.confidence).collect();
    // Newest first.
    assert_eq!(confidences, vec![70.0, 80.0, 90.0]);
}

#[test]
fn queue_overflow_keeps_newest_sightings() {
    let harness = Harness::new();
    // Twelve people in distinct buckets on every frame, far more than the queue holds.
    let crowd: Vec<Detection> = (0..12)
        .map(|i| {
            let x = i as f32 * 50.0;
            person(x, 0.0, x + 40.0, 100.0, 0.9)
        })
        .collect();
    let config = PipelineConfig {
        queue_capacity: 4,
        ..PipelineConfig::default()
    };
    let engine_backend = StubBackend::repeating(crowd);
    let pipeline = CameraPipeline::new(
        "Plaza",
        config,
        DetectionEngine::new(Box::new(engine_backend), ObjectClass::Person)
            .with_max_detections(12),
        Arc::new(Annotator::new()),
        harness.collaborators(),
    );

    let outcome = pipeline.detect_stage().process(&frame_at(0, 1), 0).unwrap();
    assert_eq!(outcome.new_sightings, 12);
    let queue = pipeline.queue();
    assert_eq!(queue.len(), 4);
    assert_eq!(queue.dropped(), 8);
    assert_eq!(pipeline.status().queue_dropped, 8);
}

#[test]
fn running_pipeline_records_sightings_and_stops() {
    let harness = Harness::new();
    let config = PipelineConfig {
        stream: stub_stream("lobby"),
        detection_interval: Duration::from_secs(3600),
        process_every_n_frames: 1,
        ..PipelineConfig::default()
    };
    let backend = StubBackend::repeating(vec![person(10.0, 10.0, 60.0, 100.0, 0.9)]);
    let calls = backend.call_counter();
    let mut pipeline = stub_pipeline("Lobby", backend, config, &harness);

    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);
    assert!(wait_for(Duration::from_secs(10), || harness.recorded() == 1));
    assert!(wait_for(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 3));
    // One spot, one sighting, however many frames were processed.
    assert_eq!(harness.recorded(), 1);
    assert!(pipeline.live_frame().is_some());

    pipeline.stop();
    assert!(pipeline.wait_stopped(Duration::from_secs(5)));
    let settled = calls.load(Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), settled);

    // A restart resumes detection with the tracker state intact.
    pipeline.start().unwrap();
    assert!(wait_for(Duration::from_secs(5), || calls.load(Ordering::SeqCst)
        > settled));
    assert_eq!(harness.recorded(), 1);
    pipeline.stop();
    assert!(pipeline.wait_stopped(Duration::from_secs(5)));
}

#[test]
fn fleet_runs_cameras_independently() {
    let harness = Harness::new();
    let pipelines = ["lobby", "gate"]
        .iter()
        .map(|name| {
            let config = PipelineConfig {
                stream: stub_stream(name),
                process_every_n_frames: 1,
                ..PipelineConfig::default()
            };
            CameraPipeline::new(
                *name,
                config,
                DetectionEngine::new(Box::new(CpuBackend::new()), ObjectClass::Person),
                Arc::new(Annotator::new()),
                harness.collaborators(),
            )
        })
        .collect();
    let fleet = FleetOrchestrator::new(
        pipelines,
        Duration::from_secs(3600),
        Duration::from_secs(300),
    )
    .unwrap();

    assert_eq!(fleet.start_all().unwrap(), 2);
    assert!(wait_for(Duration::from_secs(10), || {
        let counts = harness.records.lock().unwrap().counts_by_camera().unwrap();
        counts.contains_key("lobby") && counts.contains_key("gate")
    }));
    assert!(fleet.live_jpeg("gate", 70).unwrap().is_some());

    fleet.stop("lobby").unwrap();
    let statuses = fleet.status();
    let lobby = statuses.iter().find(|s| s.camera_id == "lobby").unwrap();
    let gate = statuses.iter().find(|s| s.camera_id == "gate").unwrap();
    assert_eq!(lobby.state, PipelineState::Stopped);
    assert_eq!(gate.state, PipelineState::Running);

    fleet.stop_all().unwrap();
    assert!(fleet.wait_stopped(Duration::from_secs(5)));
    assert!(fleet.start("nowhere").is_err());
}

#[test]
fn restart_keeps_a_single_downstream_consumer() {
    let harness = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig {
        stream: stub_stream("dock"),
        ..PipelineConfig::default()
    };
    let mut pipeline = quiet_pipeline(config, &harness, sink.clone());

    pipeline.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    // Straight back up while the old downstream worker still waits on the queue.
    pipeline.stop();
    pipeline.start().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Running);

    let queue = pipeline.queue();
    for index in 0..30 {
        queue.push(tagged_event(0, index));
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(wait_for(Duration::from_secs(10), || sink.delivered().len() == 30));

    assert_eq!(sink.threads().len(), 1);
    assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
    let order: Vec<i64> = sink.delivered().iter().map(|(_, at)| tag_of(*at).1).collect();
    assert_eq!(order, (0..30).collect::<Vec<_>>());

    pipeline.stop();
    assert!(pipeline.wait_stopped(Duration::from_secs(5)));
}

#[test]
fn concurrent_producers_keep_their_order_downstream() {
    const PRODUCERS: i64 = 4;
    const PER_PRODUCER: i64 = 50;

    let harness = Harness::new();
    let sink = Arc::new(RecordingSink::default());
    let config = PipelineConfig {
        stream: stub_stream("dock"),
        queue_capacity: 16,
        ..PipelineConfig::default()
    };
    let mut pipeline = quiet_pipeline(config, &harness, sink.clone());
    pipeline.start().unwrap();

    let queue = pipeline.queue();
    let barrier = Arc::new(Barrier::new(PRODUCERS as usize));
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                for index in 0..PER_PRODUCER {
                    queue.push(tagged_event(producer, index));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    // Every event is either delivered or counted as evicted.
    let total = (PRODUCERS * PER_PRODUCER) as u64;
    assert!(wait_for(Duration::from_secs(10), || {
        sink.delivered().len() as u64 + queue.dropped() == total
    }));

    let delivered = sink.delivered();
    assert!(!delivered.is_empty());
    for producer in 0..PRODUCERS {
        let indices: Vec<i64> = delivered
            .iter()
            .map(|(_, at)| tag_of(*at))
            .filter(|(from, _)| *from == producer)
            .map(|(_, index)| index)
            .collect();
        assert!(
            indices.windows(2).all(|pair| pair[0] < pair[1]),
            "producer {} delivered out of order: {:?}",
            producer,
            indices
        );
    }
    assert_eq!(sink.threads().len(), 1);
    assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);

    pipeline.stop();
    assert!(pipeline.wait_stopped(Duration::from_secs(5)));
}
