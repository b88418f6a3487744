//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over strides 8/16/32 followed by greedy NMS. The
//! network input size is configurable: a 320px pass is the fast first
//! backend, a 640px pass catches faces the coarse pass misses.

use crate::detection::FaceDetect;
use crate::error::BackendError;
use crate::types::{BoundingBox, FaceImage};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Placement of the source image inside the square network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    scaled_width: u32,
    scaled_height: u32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, input_size: usize) -> Self {
        let size = input_size as f32;
        let scale = (size / width.max(1) as f32).min(size / height.max(1) as f32);
        let scaled_width = ((width as f32 * scale).round() as u32).clamp(1, input_size as u32);
        let scaled_height = ((height as f32 * scale).round() as u32).clamp(1, input_size as u32);
        Self {
            scale,
            scaled_width,
            scaled_height,
            pad_x: (input_size as u32 - scaled_width) as f32 / 2.0,
            pad_y: (input_size as u32 - scaled_height) as f32 / 2.0,
        }
    }

    /// Map a point in network-input space back to source-image space.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector at a fixed input resolution.
pub struct ScrfdDetector {
    name: String,
    session: Session,
    input_size: usize,
    outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD model, running it at `input_size`×`input_size`.
    pub fn load(model_path: &Path, input_size: usize) -> Result<Self, BackendError> {
        if !model_path.exists() {
            return Err(BackendError::ModelNotFound(model_path.display().to_string()));
        }
        if input_size == 0 || input_size % 32 != 0 {
            return Err(BackendError::InferenceFailed(format!(
                "SCRFD input size must be a positive multiple of 32, got {input_size}"
            )));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(BackendError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }
        let outputs = map_outputs(&names);

        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?names,
            "loaded SCRFD model"
        );

        Ok(Self {
            name: format!("scrfd-{input_size}"),
            session,
            input_size,
            outputs,
        })
    }

    /// Detect faces, returning boxes sorted by descending confidence.
    pub fn detect_faces(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, BackendError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox_tensor(image, self.input_size);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let idx = self.outputs[slot];
            let (_, scores) = outputs[idx.score]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[idx.bbox]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[idx.kps]
                .try_extract_tensor::<f32>()
                .map_err(|e| BackendError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            candidates.extend(decode_level(scores, bboxes, kps, stride, self.input_size, &letterbox));
        }

        Ok(suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceDetect for ScrfdDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, BackendError> {
        self.detect_faces(image)
    }
}

/// Resize into the letterboxed NCHW input tensor. Padding normalizes to 0.
fn letterbox_tensor(image: &FaceImage, input_size: usize) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), input_size);
    let resized = imageops::resize(
        image.rgb(),
        letterbox.scaled_width,
        letterbox.scaled_height,
        FilterType::Triangle,
    );

    let off_x = letterbox.pad_x.floor() as usize;
    let off_y = letterbox.pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for (channel, &value) in pixel.0.iter().enumerate() {
            tensor[[0, channel, off_y + y as usize, off_x + x as usize]] =
                (value as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Resolve output tensor positions by name ("score_8", "bbox_16", "kps_32", ...).
///
/// Exports with generic numeric names use the standard positional layout:
/// scores 0-2, bboxes 3-5, keypoints 6-8.
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let positional: [StrideOutputs; 3] = std::array::from_fn(|i| StrideOutputs {
        score: i,
        bbox: i + 3,
        kps: i + 6,
    });
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let mut mapped = positional;
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (position("score", stride), position("bbox", stride), position("kps", stride)) {
            (Some(score), Some(bbox), Some(kps)) => mapped[slot] = StrideOutputs { score, bbox, kps },
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
                return positional;
            }
        }
    }
    mapped
}

/// Decode the detections of one stride level into source-image coordinates.
fn decode_level(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > SCRFD_CONFIDENCE_THRESHOLD)
        .filter_map(|(i, &score)| {
            let cell = i / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * step;
            let cy = (cell / grid) as f32 * step;

            let d = bboxes.get(i * 4..i * 4 + 4)?;
            let (x1, y1) = letterbox.to_source(cx - d[0] * step, cy - d[1] * step);
            let (x2, y2) = letterbox.to_source(cx + d[2] * step, cy + d[3] * step);

            let landmarks = kps.get(i * 10..i * 10 + 10).map(|k| {
                std::array::from_fn(|p| letterbox.to_source(cx + k[2 * p] * step, cy + k[2 * p + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
fn suppress_overlaps(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x, y, width: w, height: h, confidence: conf, landmarks: None,
        }
    }

    #[test]
    fn test_suppress_overlaps() {
        let boxes = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = suppress_overlaps(boxes, SCRFD_NMS_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_suppress_overlaps_empty() {
        assert!(suppress_overlaps(Vec::new(), SCRFD_NMS_THRESHOLD).is_empty());
    }

    #[test]
    fn test_letterbox_fit_landscape() {
        let lb = Letterbox::fit(640, 320, 320);
        assert!((lb.scale - 0.5).abs() < 1e-6);
        assert_eq!((lb.scaled_width, lb.scaled_height), (320, 160));
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 80.0);
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240, 640);
        let (sx, sy) = (100.0f32, 50.0f32);
        let (nx, ny) = (sx * lb.scale + lb.pad_x, sy * lb.scale + lb.pad_y);
        let (rx, ry) = lb.to_source(nx, ny);
        assert!((rx - sx).abs() < 0.1, "x: {rx} vs {sx}");
        assert!((ry - sy).abs() < 0.1, "y: {ry} vs {sy}");
    }

    #[test]
    fn test_letterbox_tensor_padding_is_zero() {
        let image = FaceImage::from_rgb(RgbImage::from_pixel(64, 32, Rgb([255, 255, 255])));
        let (tensor, lb) = letterbox_tensor(&image, 64);
        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
        assert_eq!(lb.pad_y, 16.0);
        // Padding rows normalize to 0, content rows to (255 - mean) / std.
        assert_eq!(tensor[[0, 0, 0, 10]], 0.0);
        let expected = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 2, 30, 10]] - expected).abs() < 1e-4);
    }

    #[test]
    fn test_map_outputs_named_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let mapped = map_outputs(&names);
        assert_eq!(mapped[0], StrideOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(mapped[2], StrideOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_map_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        let mapped = map_outputs(&names);
        assert_eq!(mapped[1], StrideOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_level_single_anchor() {
        // 64px input at stride 32 → 2×2 grid, 8 anchors. Fire anchor 3 (cell 1: cx=32, cy=0).
        let lb = Letterbox::fit(64, 64, 64);
        let mut scores = vec![0.0f32; 8];
        scores[3] = 0.9;
        let mut bboxes = vec![0.0f32; 32];
        bboxes[12..16].copy_from_slice(&[0.5, 0.0, 0.5, 1.0]);
        let kps = vec![0.0f32; 80];

        let dets = decode_level(&scores, &bboxes, &kps, 32, 64, &lb);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 16.0).abs() < 1e-4);
        assert!((d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 32.0).abs() < 1e-4);
        assert!((d.height - 32.0).abs() < 1e-4);
        assert_eq!(d.landmarks.unwrap()[0], (32.0, 0.0));
    }
}
