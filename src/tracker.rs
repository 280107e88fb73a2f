//! Per-camera sighting de-duplication.
//!
//! Raw detections jitter by a few pixels from frame to frame. The tracker quantizes each
//! detection's center and area into a `SightingKey` and only reports a key as `New` when it
//! has not been seen, or when the cooldown has elapsed since it last produced a sighting.
//!
//! This is a heuristic, not re-identification. Two people standing in the same buckets
//! merge; one person straddling a bucket edge may split. Both are accepted.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};

use crate::detect::{BoundingBox, Detection};

pub const DEFAULT_POSITION_BUCKET_PX: u32 = 50;
pub const DEFAULT_AREA_BUCKET_PX2: u32 = 1000;
pub const DEFAULT_DETECTION_INTERVAL: Duration = Duration::from_secs(180);
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

/// Bucket sizes used to quantize a detection into a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuantizationGrid {
    pub position_px: u32,
    pub area_px2: u32,
}

impl Default for QuantizationGrid {
    fn default() -> Self {
        Self {
            position_px: DEFAULT_POSITION_BUCKET_PX,
            area_px2: DEFAULT_AREA_BUCKET_PX2,
        }
    }
}

impl QuantizationGrid {
    /// Quantize a box: integer corners, then center and area divided into buckets.
    pub fn key_for(&self, bbox: &BoundingBox) -> SightingKey {
        let [x1, y1, x2, y2] = bbox.to_pixels();
        let position = i64::from(self.position_px.max(1));
        let area_bucket = i64::from(self.area_px2.max(1));

        let cx = (x1 + x2).div_euclid(2);
        let cy = (y1 + y2).div_euclid(2);
        let area = (x2 - x1) * (y2 - y1);

        SightingKey {
            cx_bucket: cx.div_euclid(position),
            cy_bucket: cy.div_euclid(position),
            area_bucket: area.div_euclid(area_bucket),
        }
    }
}

/// Coarse identity of "the same subject" on one camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SightingKey {
    pub cx_bucket: i64,
    pub cy_bucket: i64,
    pub area_bucket: i64,
}

impl fmt::Display for SightingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.cx_bucket, self.cy_bucket, self.area_bucket)
    }
}

// ----------------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SightingRecord {
    /// When this key last produced a `New` classification.
    pub timestamp: DateTime<Utc>,
    pub bbox: BoundingBox,
    /// Set by downstream consumers that track delivery; the tracker itself only ever
    /// writes `false`.
    pub notified: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Classification {
    New,
    Duplicate,
}

/// Day boundary at which tracker state is reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DayRollover {
    /// Host-local midnight.
    #[default]
    Local,
    /// UTC midnight.
    Utc,
    /// Never reset on date change.
    Disabled,
}

impl DayRollover {
    fn day_of(&self, at: DateTime<Utc>) -> Option<NaiveDate> {
        match self {
            DayRollover::Local => Some(at.with_timezone(&Local).date_naive()),
            DayRollover::Utc => Some(at.date_naive()),
            DayRollover::Disabled => None,
        }
    }
}

impl FromStr for DayRollover {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" => Ok(DayRollover::Local),
            "utc" => Ok(DayRollover::Utc),
            "disabled" | "off" | "none" => Ok(DayRollover::Disabled),
            other => Err(anyhow!("unknown rollover policy '{}'", other)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

pub struct SightingTracker {
    grid: QuantizationGrid,
    detection_interval: Duration,
    rollover: DayRollover,
    current_day: Option<NaiveDate>,
    records: HashMap<SightingKey, SightingRecord>,
}

impl SightingTracker {
    pub fn new(grid: QuantizationGrid, detection_interval: Duration) -> Self {
        Self {
            grid,
            detection_interval,
            rollover: DayRollover::Disabled,
            current_day: None,
            records: HashMap::new(),
        }
    }

    pub fn with_rollover(mut self, rollover: DayRollover) -> Self {
        self.rollover = rollover;
        self
    }

    pub fn key_for(&self, detection: &Detection) -> SightingKey {
        self.grid.key_for(&detection.bbox)
    }

    /// Classify one detection observed at `now`, inserting or refreshing its record.
    ///
    /// A key is `New` when unseen or when strictly more than the detection interval has
    /// passed since its record was written. Duplicates leave the record untouched.
    pub fn classify(&mut self, detection: &Detection, now: DateTime<Utc>) -> Classification {
        self.roll_day(now);
        let key = self.key_for(detection);
        let fresh = SightingRecord {
            timestamp: now,
            bbox: detection.bbox,
            notified: false,
        };

        match self.records.get_mut(&key) {
            None => {
                self.records.insert(key, fresh);
                Classification::New
            }
            Some(record) => {
                let elapsed = (now - record.timestamp).to_std().unwrap_or(Duration::ZERO);
                if elapsed > self.detection_interval {
                    *record = fresh;
                    Classification::New
                } else {
                    Classification::Duplicate
                }
            }
        }
    }

    /// Drop every record idle for strictly longer than `retention`. Returns how many.
    pub fn expire_stale(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| {
            let idle = (now - record.timestamp).to_std().unwrap_or(Duration::ZERO);
            idle <= retention
        });
        before - self.records.len()
    }

    pub fn reset_all(&mut self) {
        self.records.clear();
    }

    pub fn record(&self, key: &SightingKey) -> Option<&SightingRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn detection_interval(&self) -> Duration {
        self.detection_interval
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let Some(today) = self.rollover.day_of(now) else {
            return;
        };
        match self.current_day {
            Some(day) if day != today => {
                log::info!(
                    "date changed {} -> {}; clearing {} tracked sightings",
                    day,
                    today,
                    self.records.len()
                );
                self.records.clear();
            }
            _ => {}
        }
        self.current_day = Some(today);
    }
}

impl Default for SightingTracker {
    fn default() -> Self {
        Self::new(QuantizationGrid::default(), DEFAULT_DETECTION_INTERVAL)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
