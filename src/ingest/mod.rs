//! Frame acquisition.
//!
//! A `FrameSource` owns one camera's acquisition worker. The worker drives a decode
//! backend, publishes every complete frame into a shared `FrameSlot`, and heals itself
//! on any decode failure:
//! - `stub://` URLs use the synthetic backend (tests, demos)
//! - everything else is decoded by an external `ffmpeg` process reading the stream
//!
//! Acquisition never surfaces a fatal error to its owner. A malformed read tears the
//! decoder down and reopens it after a fixed backoff, forever, while the source runs.
//! An unreachable camera simply never publishes a frame.

mod ffmpeg;
mod synthetic;

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameSlot, DEFAULT_HISTORY_FRAMES};
use crate::{join_within, sleep_while_running, RESTART_GRACE};

pub use ffmpeg::FfmpegDecoder;
pub use synthetic::{SubjectMode, SyntheticDecoder};

/// Stream parameters, fixed per deployment.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream URL (e.g., "rtsp://192.168.1.100:554/stream" or "stub://lobby").
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    /// Rolling history depth.
    pub history: usize,
    /// Delay before reopening a failed decoder.
    pub restart_backoff: Duration,
    /// Passed to ffmpeg as `-rtsp_transport` for rtsp:// URLs.
    pub rtsp_transport: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "stub://front_gate".to_string(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            history: DEFAULT_HISTORY_FRAMES,
            restart_backoff: Duration::from_secs(1),
            rtsp_transport: "tcp".to_string(),
        }
    }
}

/// Counters shared between the acquisition worker and observers.
#[derive(Debug, Default)]
pub struct SourceStats {
    frames_captured: AtomicU64,
    restarts: AtomicU64,
    current_fps: AtomicU32,
}

/// Point-in-time copy of `SourceStats`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceStatsSnapshot {
    pub frames_captured: u64,
    pub restarts: u64,
    pub current_fps: u32,
}

impl SourceStats {
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            current_fps: self.current_fps.load(Ordering::Relaxed),
        }
    }
}

/// Continuous frame source for one camera.
pub struct FrameSource {
    camera_id: String,
    config: StreamConfig,
    slot: Arc<FrameSlot>,
    stats: Arc<SourceStats>,
    running: Option<Arc<AtomicBool>>,
    worker: Option<JoinHandle<()>>,
}

impl FrameSource {
    pub fn new(camera_id: impl Into<String>, config: StreamConfig) -> Self {
        let slot = Arc::new(FrameSlot::new(config.history));
        Self {
            camera_id: camera_id.into(),
            config,
            slot,
            stats: Arc::new(SourceStats::default()),
            running: None,
            worker: None,
        }
    }

    /// Begin continuous acquisition. Calling `start` on a running source is a no-op.
    ///
    /// Only configuration problems (unsupported URL, bad stub parameters) and a worker
    /// from the previous run that will not exit are reported; stream failures are
    /// retried inside the worker.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        // One publisher per slot: the stopped worker must be gone first.
        if !self.wait_stopped(RESTART_GRACE) {
            return Err(anyhow!(
                "[{}] previous acquisition worker has not exited",
                self.camera_id
            ));
        }
        let decoder = DecodeBackend::for_config(&self.config)?;
        let running = Arc::new(AtomicBool::new(true));
        let worker = AcquisitionWorker {
            camera_id: self.camera_id.clone(),
            decoder,
            slot: self.slot.clone(),
            stats: self.stats.clone(),
            running: running.clone(),
            backoff: self.config.restart_backoff,
            // Sequence numbers keep increasing across restarts of the same source.
            last_sequence: self.slot.latest().map_or(0, |frame| frame.sequence),
        };
        let handle = std::thread::Builder::new()
            .name(format!("acquire:{}", self.camera_id))
            .spawn(move || worker.run())
            .map_err(|e| anyhow!("failed to spawn acquisition worker: {}", e))?;
        self.running = Some(running);
        self.worker = Some(handle);
        Ok(())
    }

    /// Signal the worker to exit at its next checkpoint. Does not wait.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::SeqCst);
        }
    }

    /// Wait up to `timeout` for the worker to exit and join it. Returns whether it did;
    /// true when there is no worker.
    pub fn wait_stopped(&mut self, timeout: Duration) -> bool {
        let mut handles: Vec<_> = self.worker.take().into_iter().collect();
        let joined = join_within(&mut handles, timeout, &self.camera_id);
        self.worker = handles.pop();
        joined
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// True once the worker thread (if any) has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Most recent complete frame, if any has arrived.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.latest()
    }

    /// Up to the last `n` frames in arrival order.
    pub fn recent_history(&self, n: usize) -> Vec<Arc<Frame>> {
        self.slot.recent(n)
    }

    pub fn stats(&self) -> SourceStatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the frame slot, for readers on other threads.
    pub fn slot(&self) -> Arc<FrameSlot> {
        self.slot.clone()
    }

    /// Shared handle to the live counters.
    pub fn stats_handle(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Decode backends
// ----------------------------------------------------------------------------

enum DecodeBackend {
    Synthetic(SyntheticDecoder),
    Ffmpeg(FfmpegDecoder),
}

impl DecodeBackend {
    fn for_config(config: &StreamConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self::Synthetic(SyntheticDecoder::new(config)?))
        } else if config.url.trim().is_empty() {
            Err(anyhow!("stream url must not be empty"))
        } else {
            Ok(Self::Ffmpeg(FfmpegDecoder::new(config)))
        }
    }

    fn open(&mut self) -> Result<()> {
        match self {
            Self::Synthetic(decoder) => decoder.open(),
            Self::Ffmpeg(decoder) => decoder.open(),
        }
    }

    fn read_frame(&mut self, sequence: u64) -> Result<Frame> {
        match self {
            Self::Synthetic(decoder) => decoder.read_frame(sequence),
            Self::Ffmpeg(decoder) => decoder.read_frame(sequence),
        }
    }

    fn close(&mut self) {
        match self {
            Self::Synthetic(decoder) => decoder.close(),
            Self::Ffmpeg(decoder) => decoder.close(),
        }
    }
}

// ----------------------------------------------------------------------------
// Acquisition loop
// ----------------------------------------------------------------------------

struct AcquisitionWorker {
    camera_id: String,
    decoder: DecodeBackend,
    slot: Arc<FrameSlot>,
    stats: Arc<SourceStats>,
    running: Arc<AtomicBool>,
    backoff: Duration,
    last_sequence: u64,
}

impl AcquisitionWorker {
    fn run(mut self) {
        let mut sequence = self.last_sequence;
        let mut fps_window = Instant::now();
        let mut fps_counter = 0u32;
        let mut opened_once = false;

        while self.running.load(Ordering::SeqCst) {
            if opened_once {
                self.stats.restarts.fetch_add(1, Ordering::Relaxed);
            }
            opened_once = true;

            if let Err(err) = self.decoder.open() {
                log::warn!("[{}] cannot open stream: {}", self.camera_id, err);
                sleep_while_running(&self.running, self.backoff);
                continue;
            }

            while self.running.load(Ordering::SeqCst) {
                match self.decoder.read_frame(sequence + 1) {
                    Ok(frame) => {
                        sequence += 1;
                        if let Err(err) = self.slot.publish(frame) {
                            log::error!("[{}] dropping frame: {}", self.camera_id, err);
                            continue;
                        }
                        self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);

                        fps_counter += 1;
                        if fps_window.elapsed() >= Duration::from_secs(1) {
                            self.stats.current_fps.store(fps_counter, Ordering::Relaxed);
                            fps_counter = 0;
                            fps_window = Instant::now();
                        }
                    }
                    Err(err) => {
                        log::warn!(
                            "[{}] cannot read data from camera: {}; restarting decoder",
                            self.camera_id,
                            err
                        );
                        break;
                    }
                }
            }

            self.decoder.close();
            self.stats.current_fps.store(0, Ordering::Relaxed);
            sleep_while_running(&self.running, self.backoff);
        }

        self.decoder.close();
        log::info!("[{}] acquisition stopped", self.camera_id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
