//! Collaborators the downstream loop hands sightings to.
//!
//! Every call here is best effort. The pipeline logs failures and moves on; nothing is
//! retried or queued.

mod cooldown;
mod images;
mod telegram;

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Local, Utc};

use crate::detect::ObjectClass;
use crate::frame::Frame;

pub use cooldown::CooldownTracker;
pub use images::{relative_image_path, safe_camera_id, FilesystemImageStore, SIGHTING_JPEG_QUALITY};
pub use telegram::{TelegramAlertSink, TelegramSettings};

/// Persists sighting images.
pub trait ImageStore: Send + Sync {
    /// Store `frame` and return its path relative to the store root. Partition
    /// directories are created on demand.
    fn save(
        &self,
        camera_id: &str,
        captured_at: DateTime<Utc>,
        class: ObjectClass,
        confidence: f32,
        frame: &Frame,
    ) -> Result<String>;

    /// Absolute location of a stored image.
    fn resolve(&self, relative: &str) -> PathBuf;
}

/// What an alert call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Skipped because the channel is cooling down.
    Suppressed,
}

/// Outbound notifications for new sightings.
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify(&self, alert: &SightingAlert) -> Result<Delivery>;

    fn notify_with_image(&self, image_path: &Path, caption: &str) -> Result<Delivery>;
}

/// Structured content of one sighting alert.
#[derive(Clone, Debug)]
pub struct SightingAlert {
    pub camera_id: String,
    pub class: ObjectClass,
    /// Confidence in [0, 1].
    pub confidence: f32,
    pub captured_at: DateTime<Utc>,
}

impl SightingAlert {
    /// Zone label: the last word of the camera id.
    pub fn zone(&self) -> &str {
        self.camera_id.split_whitespace().last().unwrap_or("Unknown")
    }

    fn local_time(&self) -> String {
        self.captured_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    /// HTML body for the text alert.
    pub fn to_html(&self) -> String {
        format!(
            "\u{1F6A8} <b>{class} Detected</b>\n\n\
             <b>Camera:</b> {camera}\n\
             <b>Detection:</b> {class}\n\
             <b>Confidence:</b> {conf:.0}%\n\
             <b>Time:</b> {time}\n\
             <b>Location:</b> Zone {zone}\n\n\
             \u{2705} <b>Image saved</b>",
            class = self.class.label(),
            camera = escape_html(&self.camera_id),
            conf = self.confidence * 100.0,
            time = self.local_time(),
            zone = escape_html(self.zone()),
        )
    }

    /// Caption for the photo alert.
    pub fn caption(&self) -> String {
        format!(
            "\u{1F4F8} <b>Detection Image</b>\n\n{}\n{}\n{:.0}% confidence",
            escape_html(&self.camera_id),
            self.local_time(),
            self.confidence * 100.0
        )
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Alert sink used when no messaging service is configured: alerts go to the log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, alert: &SightingAlert) -> Result<Delivery> {
        log::info!(
            "[{}] ALERT {} detected ({:.0}%) in zone {}",
            alert.camera_id,
            alert.class,
            alert.confidence * 100.0,
            alert.zone()
        );
        Ok(Delivery::Sent)
    }

    fn notify_with_image(&self, image_path: &Path, _caption: &str) -> Result<Delivery> {
        log::info!("ALERT image {}", image_path.display());
        Ok(Delivery::Sent)
    }
}
