use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection, ObjectClass};
use crate::frame::{Frame, RGB_CHANNELS};

/// Luminance above which a pixel counts as foreground.
const BRIGHT_LUMA: u32 = 200;
/// Smallest foreground region reported, as a fraction of the frame area.
const MIN_AREA_FRACTION: f32 = 0.002;

/// CPU fallback backend.
///
/// Reports the bounding box of bright foreground pixels as a single person. This is
/// enough to drive synthetic `stub://` streams end to end without a model file; on real
/// footage it behaves like a crude presence detector.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl DetectorBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        if frame.channels != RGB_CHANNELS {
            return Err(anyhow!(
                "cpu backend expects RGB frames, got {} channels",
                frame.channels
            ));
        }

        let width = frame.width as usize;
        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut bright = 0usize;

        for (idx, px) in frame.pixels().chunks_exact(3).enumerate() {
            // Rec. 601 integer luma.
            let luma = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
            if luma <= BRIGHT_LUMA {
                continue;
            }
            let (x, y) = (idx % width, idx / width);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            bright += 1;
        }

        let frame_area = (frame.width as f32) * (frame.height as f32);
        if bright == 0 || (bright as f32) < frame_area * MIN_AREA_FRACTION {
            return Ok(Vec::new());
        }

        let bbox = BoundingBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + 1) as f32,
            (max_y + 1) as f32,
        );
        // Fill ratio of the box doubles as confidence: a solid blob scores high.
        let fill = bright as f32 / bbox.area();
        let confidence = (0.5 + fill * 0.45).clamp(0.0, 0.95);

        Ok(vec![Detection::new(bbox, confidence, ObjectClass::Person)])
    }
}
