//! Probe-against-gallery recognition.
//!
//! Every stored reference is compared pairwise with the probe until one
//! verifies. There is no embedding index: cost is O(n) full comparisons per
//! request for n known identities.

use crate::error::BackendError;
use crate::types::FaceImage;
use serde::Serialize;

/// Display name reported when no identity matched or a name cannot be resolved.
pub const UNKNOWN_PERSON: &str = "Unknown";

/// Outcome of one pairwise comparison.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Verification {
    pub verified: bool,
    pub similarity: f32,
}

/// A pairwise same-person verification capability.
///
/// A gallery scan calls [`Verify::prepare`] once with the query photo, then
/// [`Verify::verify`] once per reference.
pub trait Verify: Send {
    fn name(&self) -> &str;

    /// Do the per-query work (detection, embedding) for the next scan.
    fn prepare(&mut self, probe: &FaceImage) -> Result<(), BackendError>;

    /// Compare the prepared query photo with one reference.
    fn verify(&mut self, reference: &FaceImage) -> Result<Verification, BackendError>;
}

/// Maps a pseudonym id to a display name, or [`UNKNOWN_PERSON`].
pub trait NameResolver {
    fn resolve(&self, pseudonym_id: &str) -> String;
}

/// Unencrypted reference photo of one registered identity.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub pseudonym_id: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recognition {
    pub person: String,
    #[serde(skip)]
    pub pseudonym_id: Option<String>,
    /// References examined before stopping.
    pub compared: usize,
    /// Comparisons that errored and were skipped.
    pub failed: usize,
}

impl Recognition {
    fn unknown(compared: usize, failed: usize) -> Self {
        Self {
            person: UNKNOWN_PERSON.to_string(),
            pseudonym_id: None,
            compared,
            failed,
        }
    }

    pub fn is_match(&self) -> bool {
        self.pseudonym_id.is_some()
    }
}

pub struct RecognitionMatcher {
    verifier: Option<Box<dyn Verify>>,
}

impl RecognitionMatcher {
    pub fn new(verifier: Box<dyn Verify>) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }

    /// A matcher with no verification backend; every probe is unknown.
    pub fn disabled() -> Self {
        Self { verifier: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    /// Compare `probe` with each reference in turn and resolve the first match.
    ///
    /// Unreadable references and failed comparisons are logged and skipped.
    pub fn recognize<I>(&mut self, probe: &FaceImage, references: I, resolver: &dyn NameResolver) -> Recognition
    where
        I: IntoIterator<Item = ReferenceImage>,
    {
        let Some(verifier) = self.verifier.as_mut() else {
            tracing::debug!("no verification backend; skipping recognition");
            return Recognition::unknown(0, 0);
        };

        let mut references = references.into_iter().peekable();
        if references.peek().is_none() {
            tracing::debug!("gallery is empty");
            return Recognition::unknown(0, 0);
        }

        if let Err(e) = verifier.prepare(probe) {
            tracing::warn!(backend = verifier.name(), error = %e, "probe not usable for recognition");
            return Recognition::unknown(0, 0);
        }

        let mut compared = 0;
        let mut failed = 0;

        for reference in references {
            compared += 1;
            let id = reference.pseudonym_id;

            let image = match FaceImage::decode(&reference.bytes) {
                Ok(image) => image,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "reference image unreadable; skipping");
                    failed += 1;
                    continue;
                }
            };

            match verifier.verify(&image) {
                Ok(v) if v.verified => {
                    tracing::info!(id = %id, similarity = v.similarity, compared, "probe matched reference");
                    let person = resolver.resolve(&id);
                    return Recognition {
                        person,
                        pseudonym_id: Some(id),
                        compared,
                        failed,
                    };
                }
                Ok(v) => tracing::debug!(id = %id, similarity = v.similarity, "no match"),
                Err(e) => {
                    tracing::warn!(id = %id, backend = verifier.name(), error = %e, "comparison failed; skipping");
                    failed += 1;
                }
            }
        }

        tracing::info!(compared, failed, "no stored identity matched the probe");
        Recognition::unknown(compared, failed)
    }
}
