//! FER+ facial expression classifier via ONNX Runtime.
//!
//! Runs the ONNX model zoo `emotion-ferplus-8` network on a 64×64 grayscale
//! face crop. The network's eight classes are mapped onto the seven-label
//! emotion set; contempt has no counterpart and is dropped before softmax.

use crate::detection::FaceDetect;
use crate::emotion::EmotionBackend;
use crate::error::BackendError;
use crate::types::{Emotion, EmotionVector, FaceImage};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// File name of the FER+ model inside the model directory.
pub const FERPLUS_MODEL_FILE: &str = "emotion-ferplus-8.onnx";

const FERPLUS_INPUT_SIZE: u32 = 64;

/// FER+ output order.
const FERPLUS_CLASSES: [Option<Emotion>; 8] = [
    Some(Emotion::Neutral),
    Some(Emotion::Happy),
    Some(Emotion::Surprise),
    Some(Emotion::Sad),
    Some(Emotion::Angry),
    Some(Emotion::Disgust),
    Some(Emotion::Fear),
    None, // contempt
];

pub struct EmotionClassifier {
    session: Session,
}

impl EmotionClassifier {
    pub fn load(model_path: &Path) -> Result<Self, BackendError> {
        if !model_path.exists() {
            return Err(BackendError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded FER+ model");
        Ok(Self { session })
    }

    /// Classify a grayscale face crop into a probability vector.
    pub fn classify(&mut self, face: &GrayImage) -> Result<EmotionVector, BackendError> {
        let input = Self::preprocess(face);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| BackendError::InferenceFailed(format!("emotion logits: {e}")))?;
        scores_from_logits(logits)
    }

    /// FER+ takes raw 0–255 intensities, 1×1×64×64.
    fn preprocess(face: &GrayImage) -> Array4<f32> {
        let size = FERPLUS_INPUT_SIZE;
        let resized = imageops::resize(face, size, size, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 1, size as usize, size as usize));
        for (x, y, pixel) in resized.enumerate_pixels() {
            tensor[[0, 0, y as usize, x as usize]] = pixel.0[0] as f32;
        }
        tensor
    }
}

/// Softmax over the mapped classes.
fn scores_from_logits(logits: &[f32]) -> Result<EmotionVector, BackendError> {
    if logits.len() != FERPLUS_CLASSES.len() {
        return Err(BackendError::InferenceFailed(format!(
            "expected {} emotion logits, got {}",
            FERPLUS_CLASSES.len(),
            logits.len()
        )));
    }

    let mapped: Vec<(Emotion, f32)> = FERPLUS_CLASSES
        .iter()
        .zip(logits)
        .filter_map(|(class, &logit)| class.map(|emotion| (emotion, logit)))
        .collect();

    let max = mapped.iter().map(|&(_, l)| l).fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(BackendError::InferenceFailed("non-finite emotion logits".into()));
    }
    let exps: Vec<(Emotion, f32)> = mapped.iter().map(|&(e, l)| (e, (l - max).exp())).collect();
    let total: f32 = exps.iter().map(|&(_, v)| v).sum();

    Ok(EmotionVector::from_scores(exps.into_iter().map(|(e, v)| (e, v / total))))
}

/// One emotion backend configuration: a detector locates the face, the
/// classifier runs on the grayscale crop. A photo in which the detector finds
/// no face fails this backend.
pub struct CroppedEmotionBackend {
    name: String,
    detector: Box<dyn FaceDetect>,
    classifier: EmotionClassifier,
}

impl CroppedEmotionBackend {
    pub fn new(detector: Box<dyn FaceDetect>, classifier: EmotionClassifier) -> Self {
        Self {
            name: format!("ferplus/{}", detector.name()),
            detector,
            classifier,
        }
    }
}

impl EmotionBackend for CroppedEmotionBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn analyze(&mut self, image: &FaceImage) -> Result<EmotionVector, BackendError> {
        let faces = self.detector.detect(image)?;
        let face = faces.first().ok_or(BackendError::NoFaceDetected)?;
        let crop = image.crop_luma(face).ok_or(BackendError::NoFaceDetected)?;
        self.classifier.classify(&crop)
    }
}
