//! Sighting Kernel
//!
//! Multi-camera person-sighting pipeline: continuous frame acquisition, object detection,
//! duplicate suppression, and a non-blocking hand-off to image storage, alerting and
//! record keeping.
//!
//! # Architecture
//!
//! Each camera runs an independent `CameraPipeline`:
//!
//! 1. **Acquisition** (`ingest`): a worker keeps the latest frame plus a short history,
//!    restarting its decoder forever on any failure.
//! 2. **Detection** (`detect`): every Nth new frame is run through the detector backend.
//! 3. **Classification** (`tracker`): detections are quantized into sighting keys; a key
//!    is New once per detection interval, otherwise a Duplicate.
//! 4. **Hand-off** (`queue`): New sightings go to a bounded queue that drops the oldest
//!    entry rather than block detection.
//! 5. **Downstream** (`pipeline`, `sinks`, `storage`): one sighting at a time is saved,
//!    alerted on and recorded. Failures are logged and never reach the detect loop.
//!
//! `FleetOrchestrator` (`fleet`) starts and stops pipelines and periodically expires
//! stale sighting records on every camera.
//!
//! # Module Structure
//!
//! - `frame`: immutable frame snapshots and bounded history
//! - `ingest`: frame sources (ffmpeg-decoded streams, synthetic `stub://` streams)
//! - `detect`: detector backends and the per-camera detection engine
//! - `tracker`, `queue`, `pipeline`, `fleet`: the per-camera and fleet-wide core
//! - `annotate`: live-view overlay
//! - `sinks`, `storage`: image store, alert sinks, sighting records
//! - `config`, `api`: daemon configuration and the live-view HTTP surface

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod fleet;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod sinks;
pub mod storage;
pub mod tracker;

pub use annotate::{Annotator, OverlayInfo};
pub use config::SightingdConfig;
pub use detect::{BoundingBox, Detection, DetectionEngine, DetectorBackend, ObjectClass};
pub use fleet::FleetOrchestrator;
pub use frame::{Frame, FrameRing, FrameSlot};
pub use ingest::{FrameSource, StreamConfig};
pub use pipeline::{
    CameraPipeline, Collaborators, DetectStage, PipelineConfig, PipelineState, PipelineStatus,
    SightingProcessor,
};
pub use queue::{SightingEvent, SightingQueue};
pub use sinks::{AlertSink, FilesystemImageStore, ImageStore, LogAlertSink, TelegramAlertSink};
pub use storage::{InMemoryRecordStore, RecordStore, SharedRecordStore, SqliteRecordStore};
pub use tracker::{Classification, DayRollover, QuantizationGrid, SightingKey, SightingTracker};

/// Longest single sleep inside `sleep_while_running`.
const RUN_FLAG_POLL: Duration = Duration::from_millis(50);

/// Sleep for up to `total`, returning early once `running` is cleared.
pub(crate) fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(RUN_FLAG_POLL));
    }
}

/// How long `start` waits for the workers of a previous run to exit.
pub(crate) const RESTART_GRACE: Duration = Duration::from_secs(5);

/// Wait up to `timeout` for every handle to finish, then join them all. Returns false,
/// leaving the handles in place, if any is still running at the deadline.
pub(crate) fn join_within(
    handles: &mut Vec<JoinHandle<()>>,
    timeout: Duration,
    owner: &str,
) -> bool {
    let deadline = Instant::now() + timeout;
    while !handles.iter().all(|handle| handle.is_finished()) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    for handle in handles.drain(..) {
        if handle.join().is_err() {
            log::error!("[{}] worker panicked", owner);
        }
    }
    true
}
