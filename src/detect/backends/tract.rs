#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::postprocess::{
    decode_yolov8, letterbox_ratio, non_max_suppression, CXCYWH, LETTERBOX_FILL,
};
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Floor applied before NMS; the engine applies the caller's real threshold afterwards.
const CANDIDATE_FLOOR: f32 = 0.25;

/// Tract-based backend for YOLOv8 ONNX detection models.
///
/// Loads a local model file once and runs it on letterboxed square inputs. Output is
/// decoded per anchor, mapped onto COCO classes and de-duplicated with NMS.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    iou_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for `input_size` x `input_size` inputs.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32, iou_threshold: f32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_size,
            iou_threshold,
        })
    }

    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32)> {
        let image = frame.to_rgb_image()?;
        let ratio = letterbox_ratio(frame.width, frame.height, self.input_size);
        let scaled_w = ((frame.width as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let scaled_h = ((frame.height as f32 * ratio).round() as u32).clamp(1, self.input_size);
        let resized = image::imageops::resize(&image, scaled_w, scaled_h, FilterType::Triangle);

        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            if (x as u32) < scaled_w && (y as u32) < scaled_h {
                resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
            } else {
                LETTERBOX_FILL
            }
        });
        Ok((input.into_tensor(), ratio))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (input, ratio) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;

        // [1, 4 + classes, anchors]
        let shape = view.shape();
        if shape.len() != 3 || shape[1] <= CXCYWH {
            return Err(anyhow!("unexpected YOLOv8 output shape {:?}", shape));
        }
        let num_classes = shape[1] - CXCYWH;
        let data: Vec<f32> = view.iter().copied().collect();

        let candidates = decode_yolov8(
            &data,
            num_classes,
            ratio,
            frame.width,
            frame.height,
            CANDIDATE_FLOOR,
        );
        Ok(non_max_suppression(candidates, self.iou_threshold))
    }

    fn warm_up(&mut self) -> Result<()> {
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::<f32>::from_elem((1, 3, side, side), LETTERBOX_FILL);
        self.model
            .run(tvec!(input.into_tensor().into()))
            .context("ONNX warm-up failed")?;
        Ok(())
    }
}
