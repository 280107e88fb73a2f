use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sighting persistence.
///
/// Writes are best effort: the pipeline logs a failed `record_sighting` and carries on.
pub trait RecordStore: Send {
    /// Persist one sighting and return its row id.
    fn record_sighting(
        &mut self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        confidence: f32,
        image_path: &str,
    ) -> Result<i64>;

    /// Most recent sightings across all cameras, newest first.
    fn recent(&mut self, limit: usize) -> Result<Vec<SightingRow>>;

    /// Most recent sightings for one camera, newest first.
    fn recent_for_camera(&mut self, camera_id: &str, limit: usize) -> Result<Vec<SightingRow>>;

    /// Sighting count per camera.
    fn counts_by_camera(&mut self) -> Result<BTreeMap<String, u64>>;

    /// Remove one row. Returns false when the id did not exist.
    fn delete(&mut self, id: i64) -> Result<bool>;
}

/// Store shared by every pipeline's downstream loop and the API.
pub type SharedRecordStore = Arc<Mutex<dyn RecordStore>>;

pub fn shared<S: RecordStore + 'static>(store: S) -> SharedRecordStore {
    Arc::new(Mutex::new(store))
}

/// One persisted sighting as read back.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SightingRow {
    pub id: i64,
    pub camera_id: String,
    /// Local wall-clock time, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,
    /// Percentage, rounded to two decimals.
    pub confidence: f64,
    pub image_path: String,
}

fn confidence_percent(confidence: f32) -> f64 {
    (f64::from(confidence) * 10_000.0).round() / 100.0
}

fn local_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string()
}

// ----------------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------------

pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_id TEXT NOT NULL,
              timestamp TEXT NOT NULL,
              confidence REAL NOT NULL,
              image_path TEXT,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_camera_timestamp ON detections(camera_id, timestamp);
            "#,
        )?;
        Ok(())
    }

    fn query_rows(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<SightingRow>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(SightingRow {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                timestamp: row.get(2)?,
                confidence: row.get(3)?,
                image_path: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

impl RecordStore for SqliteRecordStore {
    fn record_sighting(
        &mut self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        confidence: f32,
        image_path: &str,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO detections (camera_id, timestamp, confidence, image_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                camera_id,
                local_timestamp(timestamp),
                confidence_percent(confidence),
                image_path,
                local_timestamp(Utc::now()),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<SightingRow>> {
        self.query_rows(
            "SELECT id, camera_id, timestamp, confidence, image_path
             FROM detections ORDER BY timestamp DESC, id DESC LIMIT ?1",
            &[&(limit as i64)],
        )
    }

    fn recent_for_camera(&mut self, camera_id: &str, limit: usize) -> Result<Vec<SightingRow>> {
        self.query_rows(
            "SELECT id, camera_id, timestamp, confidence, image_path
             FROM detections WHERE camera_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
            &[&camera_id, &(limit as i64)],
        )
    }

    fn counts_by_camera(&mut self) -> Result<BTreeMap<String, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT camera_id, COUNT(*) FROM detections GROUP BY camera_id")?;
        let mut rows = stmt.query([])?;
        let mut counts = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let camera: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            counts.insert(camera, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM detections WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

// ----------------------------------------------------------------------------
// In-memory
// ----------------------------------------------------------------------------

/// Non-persistent store for tests and demo runs without a database.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    rows: Vec<SightingRow>,
    next_id: i64,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn newest_first<'a>(rows: impl Iterator<Item = &'a SightingRow>, limit: usize) -> Vec<SightingRow> {
        let mut out: Vec<SightingRow> = rows.cloned().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        out
    }
}

impl RecordStore for InMemoryRecordStore {
    fn record_sighting(
        &mut self,
        camera_id: &str,
        timestamp: DateTime<Utc>,
        confidence: f32,
        image_path: &str,
    ) -> Result<i64> {
        if camera_id.is_empty() {
            return Err(anyhow!("camera id must not be empty"));
        }
        self.next_id += 1;
        self.rows.push(SightingRow {
            id: self.next_id,
            camera_id: camera_id.to_string(),
            timestamp: local_timestamp(timestamp),
            confidence: confidence_percent(confidence),
            image_path: image_path.to_string(),
        });
        Ok(self.next_id)
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<SightingRow>> {
        Ok(Self::newest_first(self.rows.iter(), limit))
    }

    fn recent_for_camera(&mut self, camera_id: &str, limit: usize) -> Result<Vec<SightingRow>> {
        Ok(Self::newest_first(
            self.rows.iter().filter(|r| r.camera_id == camera_id),
            limit,
        ))
    }

    fn counts_by_camera(&mut self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.camera_id.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let before = self.rows.len();
        self.rows.retain(|r| r.id != id);
        Ok(self.rows.len() != before)
    }
}
