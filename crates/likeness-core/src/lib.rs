//! likeness-core — Face detection, verification and emotion analysis.
//!
//! Backends (SCRFD detection, ArcFace verification, FER+ emotion) run via
//! ONNX Runtime on the CPU. Orchestrators sit above them: ordered-fallback
//! detection, multi-backend emotion consensus, and probe-vs-gallery matching.

pub mod alignment;
pub mod classifier;
pub mod detection;
pub mod detector;
pub mod emotion;
pub mod error;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use classifier::{CroppedEmotionBackend, EmotionClassifier};
pub use detection::{DetectionOrchestrator, DetectionResult, FaceDetect, SharedDetector};
pub use detector::ScrfdDetector;
pub use emotion::{EmotionAnalysis, EmotionConsensusEngine, EmotionError, EmotionMode};
pub use error::BackendError;
pub use matcher::{NameResolver, Recognition, RecognitionMatcher, ReferenceImage, Verify, UNKNOWN_PERSON};
pub use recognizer::{ArcFaceVerifier, FaceRecognizer};
pub use types::{BoundingBox, Embedding, Emotion, EmotionVector, FaceImage};

/// Directory searched for ONNX models when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/likeness/models")
}
