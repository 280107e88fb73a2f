use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};

use super::ImageStore;
use crate::detect::ObjectClass;
use crate::frame::Frame;

/// JPEG quality for stored sighting images.
pub const SIGHTING_JPEG_QUALITY: u8 = 95;

/// Day- and camera-partitioned JPEG store:
/// `<root>/<YYYYMMDD>/<camera>/<class>_<YYYYMMDD_HHMMSS_mmm>_<conf>.jpg`.
#[derive(Clone, Debug)]
pub struct FilesystemImageStore {
    root: PathBuf,
    quality: u8,
}

impl FilesystemImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            quality: SIGHTING_JPEG_QUALITY,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Camera id made safe for use as a directory name.
pub fn safe_camera_id(camera_id: &str) -> String {
    camera_id.replace([' ', '/'], "_")
}

/// Relative path (with `/` separators) an image for this sighting is stored under.
pub fn relative_image_path(
    camera_id: &str,
    captured_at: DateTime<Utc>,
    class: ObjectClass,
    confidence: f32,
) -> String {
    let local = captured_at.with_timezone(&Local);
    format!(
        "{}/{}/{}_{}_{:.0}.jpg",
        local.format("%Y%m%d"),
        safe_camera_id(camera_id),
        class.label().to_lowercase(),
        local.format("%Y%m%d_%H%M%S_%3f"),
        confidence * 100.0
    )
}

impl ImageStore for FilesystemImageStore {
    fn save(
        &self,
        camera_id: &str,
        captured_at: DateTime<Utc>,
        class: ObjectClass,
        confidence: f32,
        frame: &Frame,
    ) -> Result<String> {
        let relative = relative_image_path(camera_id, captured_at, class, confidence);
        let path = self.resolve(&relative);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("create image directory {}", dir.display()))?;
        }
        let jpeg = frame.encode_jpeg(self.quality)?;
        fs::write(&path, jpeg).with_context(|| format!("write image {}", path.display()))?;
        Ok(relative)
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn saves_into_day_and_camera_partition() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FilesystemImageStore::new(dir.path());
        let frame = Frame::rgb(vec![128; 16 * 8 * 3], 16, 8, Utc::now(), 1)?;
        let at = Local
            .with_ymd_and_hms(2024, 5, 17, 9, 30, 5)
            .unwrap()
            .with_timezone(&Utc);

        let relative = store.save("Front Gate/East", at, ObjectClass::Person, 0.876, &frame)?;
        assert_eq!(
            relative,
            "20240517/Front_Gate_East/person_20240517_093005_000_88.jpg"
        );

        let bytes = fs::read(store.resolve(&relative))?;
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn unwritable_root_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x")?;
        let store = FilesystemImageStore::new(&blocker);
        let frame = Frame::rgb(vec![0; 12], 2, 2, Utc::now(), 1)?;
        assert!(store
            .save("lobby", Utc::now(), ObjectClass::Person, 0.7, &frame)
            .is_err());
        Ok(())
    }
}
