use anyhow::Result;

use super::backend::DetectorBackend;
use super::result::{Detection, ObjectClass};
use crate::frame::Frame;

/// Default per-call cap on returned detections.
pub const DEFAULT_MAX_DETECTIONS: usize = 15;

/// Target-class detector around one backend.
///
/// `detect` is a function of the frame and threshold only: the engine holds the loaded
/// backend and its fixed filtering policy, nothing observed from earlier frames.
pub struct DetectionEngine {
    backend: Box<dyn DetectorBackend>,
    target: ObjectClass,
    max_detections: usize,
}

impl DetectionEngine {
    pub fn new(backend: Box<dyn DetectorBackend>, target: ObjectClass) -> Self {
        Self {
            backend,
            target,
            max_detections: DEFAULT_MAX_DETECTIONS,
        }
    }

    /// Cap the number of detections returned per call (minimum 1).
    pub fn with_max_detections(mut self, max: usize) -> Self {
        self.max_detections = max.max(1);
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn target(&self) -> ObjectClass {
        self.target
    }

    /// Detections of the target class with `confidence >= threshold`, highest first,
    /// at most `max_detections`. Invalid boxes are discarded.
    pub fn detect(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        let mut detections: Vec<Detection> = self
            .backend
            .detect(frame)?
            .into_iter()
            .filter(|d| d.class == self.target)
            .filter(|d| d.confidence >= threshold && d.confidence <= 1.0)
            .filter(|d| d.bbox.is_valid())
            .collect();

        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        detections.truncate(self.max_detections);
        Ok(detections)
    }
}
