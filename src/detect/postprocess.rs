//! YOLOv8 pre/post-processing shared by model backends.
//!
//! Kept free of any inference runtime so the geometry can be tested without a model.

use crate::detect::result::{BoundingBox, Detection, ObjectClass};

/// Number of leading box values (cx, cy, w, h) per YOLOv8 prediction.
pub const CXCYWH: usize = 4;

/// Gray used for the letterbox padding.
pub const LETTERBOX_FILL: f32 = 144.0 / 255.0;

/// Uniform scale mapping a `width` x `height` frame into a square model input.
pub fn letterbox_ratio(width: u32, height: u32, input_size: u32) -> f32 {
    (input_size as f32 / width as f32).min(input_size as f32 / height as f32)
}

/// Decode a `[4 + num_classes, num_anchors]` row-major YOLOv8 output.
///
/// Each anchor takes its best class. Anchors below `min_confidence` are skipped, boxes
/// are scaled back by `ratio` and clamped to the frame.
pub fn decode_yolov8(
    output: &[f32],
    num_classes: usize,
    ratio: f32,
    frame_width: u32,
    frame_height: u32,
    min_confidence: f32,
) -> Vec<Detection> {
    let rows = CXCYWH + num_classes;
    if num_classes == 0 || output.len() % rows != 0 || ratio <= 0.0 {
        return Vec::new();
    }
    let anchors = output.len() / rows;
    let at = |row: usize, anchor: usize| output[row * anchors + anchor];

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_id, confidence) = (0..num_classes)
            .map(|c| (c, at(CXCYWH + c, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, x| if x.1 > best.1 { x } else { best });

        if !confidence.is_finite() || confidence < min_confidence {
            continue;
        }

        let cx = at(0, anchor) / ratio;
        let cy = at(1, anchor) / ratio;
        let w = at(2, anchor) / ratio;
        let h = at(3, anchor) / ratio;
        let bbox = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
            .clamp_to(frame_width, frame_height);
        if !bbox.is_valid() {
            continue;
        }

        detections.push(Detection::new(
            bbox,
            confidence.min(1.0),
            ObjectClass::from_coco_id(class_id),
        ));
    }
    detections
}

/// Greedy per-class non-maximum suppression. Output is sorted by confidence, descending.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class == candidate.class && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}
