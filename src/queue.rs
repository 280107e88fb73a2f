//! Bounded hand-off between a camera's detect loop and its downstream loop.
//!
//! `push` never blocks: when the queue is full the oldest pending event is discarded and
//! counted. `pop_timeout` lets the consumer wake periodically to observe shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::detect::{BoundingBox, ObjectClass};
use crate::frame::Frame;
use crate::tracker::SightingKey;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// One new sighting, immutable once built.
#[derive(Clone, Debug)]
pub struct SightingEvent {
    pub camera_id: String,
    pub captured_at: DateTime<Utc>,
    pub class: ObjectClass,
    pub confidence: f32,
    pub bbox: BoundingBox,
    /// Frame the detection was made on. Frames are never mutated, so sharing the
    /// snapshot is equivalent to copying it.
    pub frame: Arc<Frame>,
    pub key: SightingKey,
}

/// Result of a non-blocking push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest pending event.
    DroppedOldest,
}

pub struct SightingQueue {
    tx: Sender<SightingEvent>,
    rx: Receiver<SightingEvent>,
    capacity: usize,
    dropped: AtomicU64,
}

impl SightingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking, evicting the oldest pending event when full.
    pub fn push(&self, event: SightingEvent) -> PushOutcome {
        let mut event = event;
        let mut outcome = PushOutcome::Queued;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return outcome,
                Err(TrySendError::Full(rejected)) => {
                    // A concurrent consumer may have drained the slot already; retry either way.
                    if let Ok(evicted) = self.rx.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "[{}] sighting queue full ({}); dropped oldest event from {}",
                            evicted.camera_id,
                            self.capacity,
                            evicted.captured_at.format("%H:%M:%S%.3f")
                        );
                        outcome = PushOutcome::DroppedOldest;
                    }
                    event = rejected;
                }
                // Both ends live in `self`, so the channel cannot disconnect.
                Err(TrySendError::Disconnected(_)) => return outcome,
            }
        }
    }

    /// Wait up to `timeout` for the next event.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<SightingEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&self) -> Option<SightingEvent> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard everything pending. Returns the number discarded.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl Default for SightingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u64) -> SightingEvent {
        let frame = Frame::rgb(vec![0; 12], 2, 2, Utc::now(), n).unwrap();
        SightingEvent {
            camera_id: "lobby".to_string(),
            captured_at: Utc::now(),
            class: ObjectClass::Person,
            confidence: 0.8,
            bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            frame: Arc::new(frame),
            key: SightingKey {
                cx_bucket: n as i64,
                cy_bucket: 0,
                area_bucket: 0,
            },
        }
    }

    #[test]
    fn overflow_drops_oldest_without_blocking() {
        let queue = SightingQueue::new(3);
        for n in 1..=3 {
            assert_eq!(queue.push(event(n)), PushOutcome::Queued);
        }
        for n in 4..=7 {
            assert_eq!(queue.push(event(n)), PushOutcome::DroppedOldest);
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 4);
        let remaining: Vec<u64> = std::iter::from_fn(|| queue.try_pop())
            .map(|e| e.frame.sequence)
            .collect();
        assert_eq!(remaining, vec![5, 6, 7]);
    }

    #[test]
    fn pop_timeout_returns_none_when_empty() {
        let queue = SightingQueue::new(2);
        assert!(queue.pop_timeout(Duration::from_millis(10)).is_none());
        queue.push(event(1));
        assert_eq!(
            queue
                .pop_timeout(Duration::from_millis(10))
                .map(|e| e.frame.sequence),
            Some(1)
        );
    }

    #[test]
    fn clear_discards_pending() {
        let queue = SightingQueue::default();
        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), DEFAULT_QUEUE_CAPACITY);
    }
}
