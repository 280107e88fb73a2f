use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// A backend turns one frame into raw detections. It may return every class it knows
/// about at any confidence; `DetectionEngine` applies the target class, threshold and
/// per-call cap. Backends hold the loaded model and nothing else between calls.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on a frame. The frame is read-only and must not be retained.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once after selection.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl DetectorBackend for Box<dyn DetectorBackend> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        (**self).detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
