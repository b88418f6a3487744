//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from aligned face crops using the
//! w600k_r50 ArcFace model, and wraps it into a pairwise verifier.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::detection::FaceDetect;
use crate::error::BackendError;
use crate::matcher::{Verification, Verify};
use crate::types::{BoundingBox, Embedding, FaceImage};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// File name of the ArcFace model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Cosine similarity at or above which two faces are the same person.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.40;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

/// ArcFace-based embedding extractor.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(model_path: &Path) -> Result<Self, BackendError> {
        if !model_path.exists() {
            return Err(BackendError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding for `face` within `image`.
    ///
    /// The face must carry landmarks; it is aligned to the canonical crop first.
    pub fn extract(&mut self, image: &FaceImage, face: &BoundingBox) -> Result<Embedding, BackendError> {
        let landmarks = face.landmarks.as_ref().ok_or(BackendError::NoLandmarks)?;
        let aligned = alignment::align_face(image.rgb(), landmarks);
        let input = Self::preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(BackendError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }

    /// 112×112 aligned RGB crop → NCHW float tensor.
    fn preprocess(aligned: &RgbImage) -> Array4<f32> {
        let size = ALIGNED_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in aligned.enumerate_pixels() {
            if x as usize >= size || y as usize >= size {
                continue;
            }
            for (channel, &value) in pixel.0.iter().enumerate() {
                tensor[[0, channel, y as usize, x as usize]] = (value as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

/// Same-person check between two photos.
///
/// Locates the most confident face in each image, embeds both with ArcFace
/// and compares cosine similarity against the threshold. The query photo is
/// embedded once in `prepare` and reused for every reference.
pub struct ArcFaceVerifier {
    detector: Box<dyn FaceDetect>,
    recognizer: FaceRecognizer,
    threshold: f32,
    probe: Option<Embedding>,
}

impl ArcFaceVerifier {
    pub fn new(detector: Box<dyn FaceDetect>, recognizer: FaceRecognizer, threshold: f32) -> Self {
        Self {
            detector,
            recognizer,
            threshold,
            probe: None,
        }
    }

    fn embed(&mut self, image: &FaceImage) -> Result<Embedding, BackendError> {
        let faces = self.detector.detect(image)?;
        let face = faces.first().ok_or(BackendError::NoFaceDetected)?;
        self.recognizer.extract(image, face)
    }
}

impl Verify for ArcFaceVerifier {
    fn name(&self) -> &str {
        "arcface"
    }

    fn prepare(&mut self, probe: &FaceImage) -> Result<(), BackendError> {
        self.probe = None;
        self.probe = Some(self.embed(probe)?);
        Ok(())
    }

    fn verify(&mut self, reference: &FaceImage) -> Result<Verification, BackendError> {
        let reference_embedding = self.embed(reference)?;
        let probe = self.probe.as_ref().ok_or(BackendError::ProbeNotPrepared)?;
        let similarity = probe.similarity(&reference_embedding);
        Ok(Verification {
            verified: similarity >= self.threshold,
            similarity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([0, 128, 255]));
        let tensor = FaceRecognizer::preprocess(&aligned);
        assert!((tensor[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (128.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_unchanged() {
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx")).err().unwrap();
        assert!(matches!(err, BackendError::ModelNotFound(_)));
    }
}
