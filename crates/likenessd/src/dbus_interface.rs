use crate::engine::{EngineError, EngineHandle};
use likeness_vault::{IdentityRegistry, KeySource, RegistryError};
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.likeness.Likeness1";
pub const OBJECT_PATH: &str = "/org/likeness/Likeness1";

/// D-Bus interface for the Likeness daemon.
///
/// Bus name: org.likeness.Likeness1
/// Object path: /org/likeness/Likeness1
pub struct LikenessService {
    engine: EngineHandle,
    registry: Arc<IdentityRegistry>,
    key_source: KeySource,
}

impl LikenessService {
    pub fn new(engine: EngineHandle, registry: Arc<IdentityRegistry>, key_source: KeySource) -> Self {
        Self {
            engine,
            registry,
            key_source,
        }
    }

    /// Run a blocking registry operation off the async executor.
    async fn with_registry<T, F>(&self, op: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&IdentityRegistry) -> Result<T, RegistryError> + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || op(&registry))
            .await
            .map_err(|e| fdo::Error::Failed(format!("registry task failed: {e}")))?
            .map_err(registry_error)
    }
}

#[interface(name = "org.likeness.Likeness1")]
impl LikenessService {
    /// Register a face photo under a display name.
    async fn register(&self, name: &str, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "register requested");
        let report = self
            .engine
            .register(name.to_string(), image)
            .await
            .map_err(engine_error)?;
        to_json(&report)
    }

    /// Detect, classify emotion and recognize a probe photo.
    async fn analyze(&self, image: Vec<u8>) -> fdo::Result<String> {
        tracing::info!(bytes = image.len(), "analyze requested");
        let report = self.engine.analyze(image).await.map_err(engine_error)?;
        tracing::info!(
            matched = report.person.is_match(),
            dominant = %report.emotion.dominant_emotion,
            elapsed_ms = report.processing_time_ms,
            "analysis complete"
        );
        to_json(&report)
    }

    /// List registered faces, newest first.
    async fn list_faces(&self) -> fdo::Result<String> {
        let faces = self.with_registry(|r| Ok(r.list()?)).await?;
        to_json(&faces)
    }

    /// Remove the face registered under `name`. Returns false if none matched.
    async fn remove_face(&self, name: &str) -> fdo::Result<bool> {
        let name = name.to_string();
        let removed = self
            .with_registry(move |r| match r.remove_by_name(&name) {
                Ok(_) => Ok(true),
                Err(RegistryError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            })
            .await?;
        tracing::info!(removed, "remove_face handled");
        Ok(removed)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let known_faces = self.with_registry(|r| Ok(r.count()?)).await?;
        let pipeline = self.engine.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "known_faces_count": known_faces,
            "detection_backends": pipeline.detection_backends,
            "emotion_mode": pipeline.emotion_mode,
            "emotion_backends": pipeline.emotion_backends,
            "verifier_available": pipeline.verifier_available,
            "encryption_enabled": true,
            "key_source": match self.key_source {
                KeySource::Supplied => "supplied",
                KeySource::Generated => "generated",
            },
            "thresholds": {
                "emotion_confidence": likeness_core::emotion::EMOTION_CONFIDENCE_THRESHOLD,
                "secondary_emotion": likeness_core::emotion::SECONDARY_EMOTION_THRESHOLD,
            },
        })
        .to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn registry_error(e: RegistryError) -> fdo::Error {
    match e {
        RegistryError::EmptyName => fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::error!(error = %other, "registry operation failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}

fn engine_error(e: EngineError) -> fdo::Error {
    match e {
        EngineError::Image(_) | EngineError::NoFaceDetected => fdo::Error::InvalidArgs(e.to_string()),
        EngineError::Registry(inner) => registry_error(inner),
        other => {
            tracing::error!(error = %other, "engine request failed");
            fdo::Error::Failed(other.to_string())
        }
    }
}
