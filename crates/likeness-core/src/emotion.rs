//! Multi-backend emotion consensus.
//!
//! The engine's mode is resolved once at startup. When backends are
//! available, every backend runs and the vectors of those that succeed are
//! averaged; failed backends are left out of the mean, not zero-filled. When
//! none are available, a fixed synthetic vector keeps callers' contracts intact.

use crate::error::BackendError;
use crate::types::{Emotion, EmotionVector, FaceImage};
use serde::Serialize;
use thiserror::Error;

/// Dominant score at or above which the analysis is reported as `success`.
pub const EMOTION_CONFIDENCE_THRESHOLD: f32 = 0.65;

/// Score at or above which a non-dominant emotion is listed as secondary.
pub const SECONDARY_EMOTION_THRESHOLD: f32 = 0.25;

/// An emotion classification capability producing a full vector.
pub trait EmotionBackend: Send {
    fn name(&self) -> &str;

    fn analyze(&mut self, image: &FaceImage) -> Result<EmotionVector, BackendError>;
}

#[derive(Error, Debug)]
pub enum EmotionError {
    #[error("emotion analysis failed on every backend: {}", .failures.join("; "))]
    AllBackendsFailed { failures: Vec<String> },
}

/// Deterministic stand-in used when no emotion backend could be loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockEmotions;

impl MockEmotions {
    pub const NOTE: &'static str = "synthetic scores: no emotion backend is available";

    pub fn vector(&self) -> EmotionVector {
        EmotionVector::from_scores([
            (Emotion::Angry, 0.05),
            (Emotion::Disgust, 0.02),
            (Emotion::Fear, 0.03),
            (Emotion::Happy, 0.35),
            (Emotion::Sad, 0.05),
            (Emotion::Surprise, 0.05),
            (Emotion::Neutral, 0.45),
        ])
    }
}

/// Process-wide emotion capability, fixed at startup.
pub enum EmotionMode {
    Available(Vec<Box<dyn EmotionBackend>>),
    Unavailable(MockEmotions),
}

impl EmotionMode {
    /// `Available` when at least one backend loaded, otherwise `Unavailable`.
    pub fn from_backends(backends: Vec<Box<dyn EmotionBackend>>) -> Self {
        if backends.is_empty() {
            EmotionMode::Unavailable(MockEmotions)
        } else {
            if backends.len() < 2 {
                tracing::warn!(
                    backend = backends[0].name(),
                    "only one emotion backend loaded; scores will not be cross-checked"
                );
            }
            EmotionMode::Available(backends)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Success,
    LowConfidence,
    Mock,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmotionAnalysis {
    pub status: AnalysisStatus,
    pub dominant_emotion: Emotion,
    pub emotion_scores: EmotionVector,
    pub confidence_level: f32,
    pub secondary_emotions: Vec<Emotion>,
    pub analysis_method: String,
    pub backends_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl EmotionAnalysis {
    /// Threshold an averaged vector into a full analysis.
    pub fn from_consensus(scores: EmotionVector, backends_used: Vec<String>) -> Self {
        let (dominant, confidence) = scores.dominant();
        let status = if confidence >= EMOTION_CONFIDENCE_THRESHOLD {
            AnalysisStatus::Success
        } else {
            AnalysisStatus::LowConfidence
        };
        Self {
            status,
            dominant_emotion: dominant,
            emotion_scores: scores,
            confidence_level: confidence,
            secondary_emotions: scores.secondary(SECONDARY_EMOTION_THRESHOLD),
            analysis_method: "multi_model_consensus".to_string(),
            backends_used,
            note: None,
        }
    }

    fn mock(generator: &MockEmotions) -> Self {
        let scores = generator.vector();
        let (dominant, confidence) = scores.dominant();
        Self {
            status: AnalysisStatus::Mock,
            dominant_emotion: dominant,
            emotion_scores: scores,
            confidence_level: confidence,
            secondary_emotions: scores.secondary(SECONDARY_EMOTION_THRESHOLD),
            analysis_method: "mock".to_string(),
            backends_used: Vec::new(),
            note: Some(MockEmotions::NOTE.to_string()),
        }
    }
}

pub struct EmotionConsensusEngine {
    mode: EmotionMode,
}

impl EmotionConsensusEngine {
    pub fn new(mode: EmotionMode) -> Self {
        match &mode {
            EmotionMode::Available(backends) => tracing::info!(
                backends = ?backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
                "emotion analysis available"
            ),
            EmotionMode::Unavailable(_) => {
                tracing::warn!("no emotion backend available; analysis will return mock data")
            }
        }
        Self { mode }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.mode, EmotionMode::Available(_))
    }

    pub fn backend_names(&self) -> Vec<String> {
        match &self.mode {
            EmotionMode::Available(backends) => backends.iter().map(|b| b.name().to_string()).collect(),
            EmotionMode::Unavailable(_) => Vec::new(),
        }
    }

    /// Average every backend that succeeds.
    ///
    /// Fails only in `Available` mode when no backend produced a vector.
    pub fn analyze(&mut self, image: &FaceImage) -> Result<EmotionAnalysis, EmotionError> {
        let backends = match &mut self.mode {
            EmotionMode::Unavailable(generator) => return Ok(EmotionAnalysis::mock(generator)),
            EmotionMode::Available(backends) => backends,
        };

        let mut vectors = Vec::with_capacity(backends.len());
        let mut used = Vec::with_capacity(backends.len());
        let mut failures = Vec::new();

        for backend in backends.iter_mut() {
            match backend.analyze(image) {
                Ok(vector) => {
                    tracing::debug!(backend = backend.name(), dominant = %vector.dominant().0, "emotion backend succeeded");
                    vectors.push(vector);
                    used.push(backend.name().to_string());
                }
                Err(e) => {
                    tracing::warn!(backend = backend.name(), error = %e, "emotion backend failed");
                    failures.push(format!("{}: {e}", backend.name()));
                }
            }
        }

        let averaged = EmotionVector::mean(&vectors).ok_or(EmotionError::AllBackendsFailed { failures })?;
        let analysis = EmotionAnalysis::from_consensus(averaged, used);
        tracing::info!(
            dominant = %analysis.dominant_emotion,
            confidence = analysis.confidence_level,
            status = ?analysis.status,
            "emotion consensus"
        );
        Ok(analysis)
    }
}
