//! Live-view overlay.
//!
//! Draws detection boxes, confidence labels and a header band (camera, time, fps, new
//! sightings) onto a copy of a frame. Pure presentation: nothing here feeds back into
//! detection or tracking. Text needs a TTF font; without one only boxes are drawn.

use std::path::Path;

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;

use crate::detect::Detection;
use crate::frame::Frame;

const HIGH_CONFIDENCE: f32 = 0.7;
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const ORANGE: Rgb<u8> = Rgb([255, 165, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 18.0;
const HEADER_SCALE: f32 = 20.0;
const HEADER_HEIGHT: u32 = 30;

/// Per-frame values shown in the header band.
#[derive(Clone, Debug, Default)]
pub struct OverlayInfo {
    pub camera_id: String,
    pub fps: u32,
    pub new_sightings: usize,
}

#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
    brand: Option<String>,
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a TTF/OTF font for labels and the header band.
    pub fn with_font_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("read font {}", path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|_| anyhow!("{} is not a usable font", path.display()))?;
        self.font = Some(font);
        Ok(self)
    }

    /// Text drawn in the bottom-right corner.
    pub fn with_brand(mut self, brand: impl Into<String>) -> Self {
        let brand = brand.into();
        self.brand = (!brand.trim().is_empty()).then_some(brand);
        self
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Return an annotated copy of `frame`. The input frame is left untouched.
    pub fn annotate(
        &self,
        frame: &Frame,
        detections: &[Detection],
        info: &OverlayInfo,
    ) -> Result<Frame> {
        let mut image = frame.to_rgb_image()?;

        for detection in detections {
            self.draw_detection(&mut image, detection);
        }
        if let Some(font) = &self.font {
            let stamp = frame
                .captured_at
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M:%S");
            let header = format!(
                "{} | {} | FPS: {} | New: {}",
                info.camera_id, stamp, info.fps, info.new_sightings
            );
            draw_header(&mut image, font, &header);
            if let Some(brand) = &self.brand {
                draw_brand(&mut image, font, brand);
            }
        }

        Ok(Frame::from_rgb_image(
            image,
            frame.captured_at,
            frame.sequence,
        ))
    }

    fn draw_detection(&self, image: &mut RgbImage, detection: &Detection) {
        let bbox = detection.bbox.clamp_to(image.width(), image.height());
        if !bbox.is_valid() {
            return;
        }
        let color = if detection.confidence > HIGH_CONFIDENCE {
            GREEN
        } else {
            ORANGE
        };
        let [x1, y1, x2, y2] = bbox.to_pixels().map(|v| v as i32);

        for inset in 0..BOX_THICKNESS {
            let w = (x2 - x1 - 2 * inset).max(1) as u32;
            let h = (y2 - y1 - 2 * inset).max(1) as u32;
            draw_hollow_rect_mut(image, Rect::at(x1 + inset, y1 + inset).of_size(w, h), color);
        }

        let Some(font) = &self.font else {
            return;
        };
        let label = format!(
            "{}: {:.1}%",
            detection.class.label(),
            detection.confidence * 100.0
        );
        let scale = PxScale::from(LABEL_SCALE);
        let (text_w, text_h) = text_size(scale, font, &label);
        let label_y = (y1 - text_h as i32 - 6).max(0);
        draw_filled_rect_mut(
            image,
            Rect::at(x1, label_y).of_size(text_w + 6, text_h + 6),
            color,
        );
        draw_text_mut(image, BLACK, x1 + 3, label_y + 3, scale, font, &label);
    }
}

fn draw_header(image: &mut RgbImage, font: &FontVec, text: &str) {
    let band = HEADER_HEIGHT.min(image.height());
    draw_filled_rect_mut(image, Rect::at(0, 0).of_size(image.width(), band), BLACK);
    draw_text_mut(image, WHITE, 6, 5, PxScale::from(HEADER_SCALE), font, text);
}

fn draw_brand(image: &mut RgbImage, font: &FontVec, brand: &str) {
    let scale = PxScale::from(LABEL_SCALE);
    let (w, h) = text_size(scale, font, brand);
    let x = image.width().saturating_sub(w + 10) as i32;
    let y = image.height().saturating_sub(h + 10) as i32;
    draw_text_mut(image, WHITE, x, y, scale, font, brand);
}
