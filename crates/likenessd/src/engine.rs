use crate::config::Config;
use likeness_core::detection::{DetectionDetails, DetectionOrchestrator, DetectionResult, FaceDetect, SharedDetector};
use likeness_core::detector::{ScrfdDetector, SCRFD_MODEL_FILE};
use likeness_core::emotion::{EmotionAnalysis, EmotionBackend, EmotionConsensusEngine, EmotionError, EmotionMode};
use likeness_core::classifier::{CroppedEmotionBackend, EmotionClassifier, FERPLUS_MODEL_FILE};
use likeness_core::matcher::{Recognition, RecognitionMatcher};
use likeness_core::recognizer::{ArcFaceVerifier, FaceRecognizer, ARCFACE_MODEL_FILE};
use likeness_core::{BackendError, FaceImage};
use likeness_vault::{IdentityRegistry, RegistryError};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// SCRFD input resolutions tried in order: fast first, then accurate.
const DETECTOR_INPUT_SIZES: [usize; 2] = [320, 640];

/// Input resolution of the detector inside the verification backend.
const VERIFIER_INPUT_SIZE: usize = 640;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("image could not be decoded: {0}")]
    Image(#[from] image::ImageError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Emotion(#[from] EmotionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

#[derive(Debug, Serialize)]
pub struct RegistrationReport {
    pub status: &'static str,
    pub message: String,
    pub detection_details: Option<DetectionDetails>,
    pub encryption_status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ImageInfo {
    pub size_bytes: usize,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub emotion: EmotionAnalysis,
    pub detection: DetectionResult,
    pub person: Recognition,
    pub processing_time_ms: u64,
    pub image: ImageInfo,
}

/// Capabilities resolved when the pipeline was built.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub detection_backends: Vec<String>,
    pub emotion_mode: &'static str,
    pub emotion_backends: Vec<String>,
    pub verifier_available: bool,
}

/// Detection, emotion and recognition backends. Inference sessions need
/// exclusive access, so the pipeline lives on the engine thread.
pub struct Pipeline {
    detection: DetectionOrchestrator,
    emotion: EmotionConsensusEngine,
    matcher: RecognitionMatcher,
}

impl Pipeline {
    pub fn new(detection: DetectionOrchestrator, emotion: EmotionConsensusEngine, matcher: RecognitionMatcher) -> Self {
        Self {
            detection,
            emotion,
            matcher,
        }
    }

    /// Load every backend the model directory supports. A backend that
    /// fails to load is logged and left out; nothing here is fatal.
    pub fn load(config: &Config) -> Self {
        let model_dir = config.model_dir.as_path();
        tracing::info!(model_dir = %model_dir.display(), "loading inference backends");

        // One SCRFD session per input size, shared by every stage below.
        let detectors: Vec<(usize, SharedDetector)> = DETECTOR_INPUT_SIZES
            .iter()
            .filter_map(|&size| load_detector(model_dir, size).map(|d| (size, SharedDetector::new(d))))
            .collect();
        if detectors.is_empty() {
            tracing::error!("no detection backend loaded; every registration will be rejected");
        }

        let emotion = EmotionConsensusEngine::new(EmotionMode::from_backends(load_emotion_backends(
            model_dir, &detectors,
        )));

        let verifier_detector = detectors
            .iter()
            .find(|(size, _)| *size == VERIFIER_INPUT_SIZE)
            .map(|(_, d)| d.clone());
        let matcher = match load_verifier(model_dir, verifier_detector, config.similarity_threshold) {
            Ok(verifier) => RecognitionMatcher::new(Box::new(verifier)),
            Err(e) => {
                tracing::warn!(error = %e, "verification backend unavailable; every probe will be unknown");
                RecognitionMatcher::disabled()
            }
        };

        let detectors = detectors
            .into_iter()
            .map(|(_, d)| Box::new(d) as Box<dyn FaceDetect>)
            .collect();
        Self::new(
            DetectionOrchestrator::new(detectors, config.min_face_size()),
            emotion,
            matcher,
        )
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            detection_backends: self.detection.backend_names(),
            emotion_mode: if self.emotion.is_available() { "available" } else { "mock" },
            emotion_backends: self.emotion.backend_names(),
            verifier_available: self.matcher.is_enabled(),
        }
    }

    /// Confirm a face is present, then enroll the photo under `name`.
    pub fn register(
        &mut self,
        registry: &IdentityRegistry,
        name: &str,
        bytes: &[u8],
    ) -> Result<RegistrationReport, EngineError> {
        if name.trim().is_empty() {
            return Err(RegistryError::EmptyName.into());
        }

        let image = FaceImage::decode(bytes)?;
        let detection = self.detection.detect(&image);
        if !detection.detected {
            tracing::info!(tried = detection.methods_tried.len(), "registration rejected: no face");
            return Err(EngineError::NoFaceDetected);
        }

        let id = registry.enroll(name, bytes)?;
        tracing::info!(id = %id, method = ?detection.method(), "face registered");

        Ok(RegistrationReport {
            status: "success",
            message: format!("Registered {}", name.trim()),
            detection_details: detection.details,
            encryption_status: "encrypted",
        })
    }

    /// Detect, classify emotion and recognize the probe.
    pub fn analyze(&mut self, registry: &IdentityRegistry, bytes: &[u8]) -> Result<AnalysisReport, EngineError> {
        let started = Instant::now();
        let image = FaceImage::decode(bytes)?;
        tracing::debug!(width = image.width(), height = image.height(), "analyzing probe");

        let detection = self.detection.detect(&image);
        let emotion = self.emotion.analyze(&image)?;

        let person = match registry.references() {
            Ok(references) => self.matcher.recognize(&image, references, registry),
            Err(e) => {
                tracing::warn!(error = %e, "reference store unreadable; skipping recognition");
                self.matcher.recognize(&image, std::iter::empty(), registry)
            }
        };

        Ok(AnalysisReport {
            emotion,
            detection,
            person,
            processing_time_ms: started.elapsed().as_millis() as u64,
            image: ImageInfo {
                size_bytes: bytes.len(),
                width: image.width(),
                height: image.height(),
            },
        })
    }
}

fn load_detector(model_dir: &Path, input_size: usize) -> Option<Box<dyn FaceDetect>> {
    match ScrfdDetector::load(&model_dir.join(SCRFD_MODEL_FILE), input_size) {
        Ok(detector) => Some(Box::new(detector)),
        Err(e) => {
            tracing::warn!(input_size, error = %e, "SCRFD detector unavailable");
            None
        }
    }
}

/// One FER+ backend per loaded detector.
fn load_emotion_backends(model_dir: &Path, detectors: &[(usize, SharedDetector)]) -> Vec<Box<dyn EmotionBackend>> {
    let mut backends: Vec<Box<dyn EmotionBackend>> = Vec::new();
    for (_, detector) in detectors {
        match EmotionClassifier::load(&model_dir.join(FERPLUS_MODEL_FILE)) {
            Ok(classifier) => backends.push(Box::new(CroppedEmotionBackend::new(Box::new(detector.clone()), classifier))),
            Err(e) => {
                tracing::warn!(error = %e, "FER+ classifier unavailable");
                break;
            }
        }
    }
    backends
}

fn load_verifier(
    model_dir: &Path,
    detector: Option<SharedDetector>,
    threshold: f32,
) -> Result<ArcFaceVerifier, BackendError> {
    let detector = detector.ok_or_else(|| {
        BackendError::ModelNotFound(format!("{SCRFD_MODEL_FILE} at {VERIFIER_INPUT_SIZE}px"))
    })?;
    let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
    Ok(ArcFaceVerifier::new(Box::new(detector), recognizer, threshold))
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Register {
        name: String,
        image: Vec<u8>,
        reply: oneshot::Sender<Result<RegistrationReport, EngineError>>,
    },
    Analyze {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<AnalysisReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    status: Arc<PipelineStatus>,
}

impl EngineHandle {
    pub async fn register(&self, name: String, image: Vec<u8>) -> Result<RegistrationReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Register {
                name,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn analyze(&self, image: Vec<u8>) -> Result<AnalysisReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze { image, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn status(&self) -> &PipelineStatus {
        &self.status
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Requests are served one at a time; the thread exits when every handle
/// has been dropped.
pub fn spawn_engine(mut pipeline: Pipeline, registry: Arc<IdentityRegistry>) -> Result<EngineHandle, EngineError> {
    let status = Arc::new(pipeline.status());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("likeness-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Register { name, image, reply } => {
                        let _ = reply.send(pipeline.register(&registry, &name, &image));
                    }
                    EngineRequest::Analyze { image, reply } => {
                        let _ = reply.send(pipeline.analyze(&registry, &image));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, status })
}
