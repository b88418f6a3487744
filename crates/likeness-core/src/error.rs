use thiserror::Error;

/// Failure of a single detection, emotion or verification backend.
///
/// Orchestrators treat these as per-attempt outcomes: they are recorded and
/// the next backend is tried.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("model file not found: {0} — place the ONNX model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("face has no landmarks — detector must return landmarks for alignment")]
    NoLandmarks,
    #[error("no probe prepared for verification")]
    ProbeNotPrepared,
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}
