#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{suppress_overlaps, BoundingBox, Detection, ObjectClass};

/// Candidates below this never leave the backend; the pipeline applies the
/// runtime threshold on top.
const MIN_CANDIDATE_SCORE: f32 = 0.25;
const NMS_IOU: f32 = 0.45;
/// 4 box coordinates followed by the 80 COCO class scores.
const YOLO_ROW: usize = 84;

/// Tract-based backend for YOLO-family ONNX detectors.
///
/// Loads a local model file with a `[1, 3, H, W]` input and a `[1, 84, N]`
/// (or `[1, N, 84]`) output, and reports one detection per surviving
/// candidate.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, width: u32, height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
        })
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized;
        let image = if image.width() == self.width && image.height() == self.height {
            image
        } else {
            resized = imageops::resize(image, self.width, self.height, FilterType::Triangle);
            &resized
        };

        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| image.get_pixel(x as u32, y as u32).0[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame_w: u32, frame_h: u32) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let view = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;
        let shape = view.shape().to_vec();
        if shape[0] != 1 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let channels_first = shape[1] == YOLO_ROW;
        let (rows, candidates) = if channels_first {
            (shape[1], shape[2])
        } else {
            (shape[2], shape[1])
        };
        if rows < 5 {
            return Err(anyhow!("model output has {} rows per candidate", rows));
        }
        let at = |row: usize, candidate: usize| {
            if channels_first {
                view[[0, row, candidate]]
            } else {
                view[[0, candidate, row]]
            }
        };

        let sx = frame_w as f32 / self.width as f32;
        let sy = frame_h as f32 / self.height as f32;
        let mut detections = Vec::new();
        for candidate in 0..candidates {
            let (class_id, score) = (4..rows)
                .map(|row| (row - 4, at(row, candidate)))
                .fold((0, f32::NEG_INFINITY), |best, next| {
                    if next.1 > best.1 {
                        next
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < MIN_CANDIDATE_SCORE {
                continue;
            }
            let (cx, cy) = (at(0, candidate), at(1, candidate));
            let (w, h) = (at(2, candidate), at(3, candidate));
            let corner = |v: f32| v.max(0.0) as u32;
            let bbox = BoundingBox::new(
                corner(cx - w / 2.0),
                corner(cy - h / 2.0),
                corner(cx + w / 2.0),
                corner(cy + h / 2.0),
            )
            .scaled(sx, sy)
            .clamp_to(frame_w, frame_h);
            detections.push(Detection {
                class: ObjectClass::from_coco(class_id),
                confidence: score.min(1.0),
                bbox,
            });
        }

        Ok(suppress_overlaps(detections, NMS_IOU))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        let input = self.build_input(image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, image.width(), image.height())
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.width, self.height);
        self.detect(&blank).map(|_| ())
    }
}
