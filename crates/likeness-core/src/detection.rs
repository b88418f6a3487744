//! Ordered-fallback face detection.
//!
//! Backends are tried in priority order; the first one that finds a face of
//! at least the minimum size wins and no further backends run.

use crate::error::BackendError;
use crate::types::{BoundingBox, FaceImage};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Minimum face size (width, height) in pixels for a detection to count.
pub const DEFAULT_MIN_FACE_SIZE: (u32, u32) = (100, 100);

/// A face detection capability.
pub trait FaceDetect: Send {
    /// Stable backend name used in diagnostics (e.g., "scrfd-320").
    fn name(&self) -> &str;

    /// Detect faces, most confident first.
    fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, BackendError>;
}

/// One loaded detector used by several pipeline stages.
///
/// Clones share the same inference session; calls are serialized on its lock.
#[derive(Clone)]
pub struct SharedDetector {
    name: String,
    inner: Arc<Mutex<Box<dyn FaceDetect>>>,
}

impl SharedDetector {
    pub fn new(detector: Box<dyn FaceDetect>) -> Self {
        Self {
            name: detector.name().to_string(),
            inner: Arc::new(Mutex::new(detector)),
        }
    }

    /// Number of handles to the underlying session.
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl FaceDetect for SharedDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, BackendError> {
        self.inner.lock().detect(image)
    }
}

/// Outcome of one backend within a detection pass.
#[derive(Debug, Clone, Serialize)]
pub struct BackendAttempt {
    pub backend: String,
    pub tried: bool,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionDetails {
    pub count: usize,
    pub locations: Vec<BoundingBox>,
    pub method: String,
}

/// Result of a detection pass. `detected == false` is a normal outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    pub detected: bool,
    pub details: Option<DetectionDetails>,
    pub methods_tried: Vec<BackendAttempt>,
}

impl DetectionResult {
    /// Name of the backend that found the face, if any.
    pub fn method(&self) -> Option<&str> {
        self.details.as_ref().map(|d| d.method.as_str())
    }

    pub fn attempt(&self, backend: &str) -> Option<&BackendAttempt> {
        self.methods_tried.iter().find(|a| a.backend == backend)
    }
}

pub struct DetectionOrchestrator {
    backends: Vec<Box<dyn FaceDetect>>,
    min_face_size: (u32, u32),
}

impl DetectionOrchestrator {
    pub fn new(backends: Vec<Box<dyn FaceDetect>>, min_face_size: (u32, u32)) -> Self {
        Self {
            backends,
            min_face_size,
        }
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Run backends in order until one finds a face above the minimum size.
    pub fn detect(&mut self, image: &FaceImage) -> DetectionResult {
        let min_size = self.min_face_size;
        let mut attempts: Vec<BackendAttempt> = self
            .backends
            .iter()
            .map(|b| BackendAttempt {
                backend: b.name().to_string(),
                tried: false,
                succeeded: false,
                error: None,
            })
            .collect();
        let mut details = None;

        for (attempt, backend) in attempts.iter_mut().zip(self.backends.iter_mut()) {
            attempt.tried = true;
            match backend.detect(image) {
                Ok(faces) => {
                    let faces: Vec<BoundingBox> = faces
                        .into_iter()
                        .filter(|f| f.meets_min_size(min_size))
                        .collect();
                    if faces.is_empty() {
                        tracing::debug!(backend = backend.name(), "no face above minimum size");
                        continue;
                    }
                    attempt.succeeded = true;
                    details = Some(DetectionDetails {
                        count: faces.len(),
                        locations: faces,
                        method: attempt.backend.clone(),
                    });
                    break;
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "face detection backend failed");
                    attempt.error = Some(e.to_string());
                }
            }
        }

        match &details {
            Some(d) => tracing::info!(method = %d.method, count = d.count, "face detected"),
            None => tracing::warn!(backends = attempts.len(), "no face detected with any backend"),
        }

        DetectionResult {
            detected: details.is_some(),
            details,
            methods_tried: attempts,
        }
    }
}
