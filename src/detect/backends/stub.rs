use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Stub backend for testing. Replays scripted detections instead of running a model.
///
/// Each `detect` call pops the next scripted batch; once the script is exhausted the
/// `fallback` batch is returned forever (empty unless set with `repeating`).
#[derive(Default)]
pub struct StubBackend {
    script: VecDeque<Vec<Detection>>,
    fallback: Vec<Detection>,
    calls: Arc<AtomicU64>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `detections` on every call.
    pub fn repeating(detections: Vec<Detection>) -> Self {
        Self {
            fallback: detections,
            ..Self::default()
        }
    }

    /// Return each batch once, in order, then nothing.
    pub fn scripted<I>(batches: I) -> Self
    where
        I: IntoIterator<Item = Vec<Detection>>,
    {
        Self {
            script: batches.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Shared counter of `detect` calls, readable after the backend moves into an engine.
    pub fn call_counter(&self) -> Arc<AtomicU64> {
        self.calls.clone()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
