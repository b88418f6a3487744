//! Enrolled identities: mapping entry, plaintext reference photo and
//! sealed photo, kept together under one pseudonym id.

use crate::cipher::ImageCipher;
use crate::error::{VaultError, VaultResult};
use crate::key::EncryptionKey;
use crate::store::ArtifactStore;
use crate::vault::{IdentityVault, MAPPING_FILE};
use chrono::{DateTime, Utc};
use likeness_core::{NameResolver, ReferenceImage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

pub const KNOWN_FACES_DIR: &str = "known_faces";
pub const ENCRYPTED_FACES_DIR: &str = "encrypted_faces";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("a non-empty name is required")]
    EmptyName,
    #[error("no known face named {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

/// Listing entry for one enrolled identity.
#[derive(Debug, Clone, Serialize)]
pub struct KnownFace {
    pub name: String,
    pub added_date: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub file_size: u64,
}

pub struct IdentityRegistry {
    data_dir: PathBuf,
    cipher: Arc<ImageCipher>,
    vault: IdentityVault,
    references: ArtifactStore,
    sealed: ArtifactStore,
}

impl IdentityRegistry {
    /// Open the registry rooted at `data_dir`, creating its directories.
    pub fn open(data_dir: &Path, key: &EncryptionKey) -> VaultResult<Self> {
        let references = ArtifactStore::references(data_dir.join(KNOWN_FACES_DIR));
        let sealed = ArtifactStore::sealed(data_dir.join(ENCRYPTED_FACES_DIR));
        for dir in [data_dir, references.root(), sealed.root()] {
            std::fs::create_dir_all(dir).map_err(|e| VaultError::persistence(dir, e))?;
        }

        let cipher = Arc::new(ImageCipher::new(key));
        let vault = IdentityVault::open(data_dir.join(MAPPING_FILE), Arc::clone(&cipher))?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            cipher,
            vault,
            references,
            sealed,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn vault(&self) -> &IdentityVault {
        &self.vault
    }

    /// Enroll `image` under `name`. Partial state is rolled back on failure.
    pub fn enroll(&self, name: &str, image: &[u8]) -> Result<String, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let sealed_image = self.cipher.seal(image)?;
        let id = self.vault.pseudonymize(name)?;

        let written = self
            .references
            .write(&id, image)
            .and_then(|()| self.sealed.write(&id, &sealed_image));
        if let Err(e) = written {
            tracing::error!(id = %id, error = %e, "enrollment failed; rolling back");
            self.discard(&id);
            return Err(e.into());
        }

        tracing::info!(id = %id, bytes = image.len(), "identity enrolled");
        Ok(id)
    }

    fn discard(&self, id: &str) {
        let results = [
            self.references.remove(id),
            self.sealed.remove(id),
            self.vault.forget(id),
        ];
        for result in results {
            if let Err(e) = result {
                tracing::warn!(id = %id, error = %e, "rollback step failed");
            }
        }
    }

    /// Remove every artifact for `id`. Returns whether anything existed.
    ///
    /// Both photo directories are moved aside before the mapping entry is
    /// forgotten and deleted only after it is gone. If forgetting fails they
    /// are moved back, leaving the identity intact.
    pub fn remove(&self, id: &str) -> VaultResult<bool> {
        let staged_reference = self.references.stage_removal(id)?;
        let staged_sealed = match self.sealed.stage_removal(id) {
            Ok(staged) => staged,
            Err(e) => {
                unstage(&self.references, id, staged_reference.as_deref());
                return Err(e);
            }
        };

        let had_entry = match self.vault.forget(id) {
            Ok(had_entry) => had_entry,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "removal failed; restoring artifacts");
                unstage(&self.references, id, staged_reference.as_deref());
                unstage(&self.sealed, id, staged_sealed.as_deref());
                return Err(e);
            }
        };

        for staged in [&staged_reference, &staged_sealed].into_iter().flatten() {
            if let Err(e) = ArtifactStore::purge(staged) {
                tracing::warn!(id = %id, error = %e, "staged artifacts left behind");
            }
        }
        Ok(staged_reference.is_some() || staged_sealed.is_some() || had_entry)
    }

    /// Remove the identity whose name matches exactly. Returns its id.
    pub fn remove_by_name(&self, name: &str) -> Result<String, RegistryError> {
        let id = self
            .vault
            .reverse_lookup(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        self.remove(&id)?;
        tracing::info!(id = %id, "identity removed");
        Ok(id)
    }

    /// Decrypt the sealed copy of an enrolled photo.
    pub fn sealed_image(&self, id: &str) -> VaultResult<Vec<u8>> {
        self.cipher.open(&self.sealed.read(id)?)
    }

    /// Enrolled identities, newest first.
    pub fn list(&self) -> VaultResult<Vec<KnownFace>> {
        let mut faces = Vec::new();
        for id in self.references.ids()? {
            let meta = match self.references.metadata(&id) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "skipping unreadable reference");
                    continue;
                }
            };
            let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
            let created = meta.created().map(DateTime::<Utc>::from).unwrap_or(modified);
            faces.push(KnownFace {
                name: self.vault.resolve(&id),
                added_date: created,
                last_modified: modified,
                file_size: meta.len(),
            });
        }
        faces.sort_by(|a, b| b.added_date.cmp(&a.added_date));
        Ok(faces)
    }

    pub fn count(&self) -> VaultResult<usize> {
        Ok(self.references.ids()?.len())
    }

    /// Gallery for recognition, read lazily in id order.
    pub fn references(&self) -> VaultResult<impl Iterator<Item = ReferenceImage> + '_> {
        self.references.reference_images()
    }
}

fn unstage(store: &ArtifactStore, id: &str, staged: Option<&Path>) {
    if let Some(staged) = staged {
        if let Err(e) = store.restore(id, staged) {
            tracing::warn!(id = %id, error = %e, "could not restore staged artifacts");
        }
    }
}

impl NameResolver for IdentityRegistry {
    fn resolve(&self, pseudonym_id: &str) -> String {
        self.vault.resolve(pseudonym_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{REFERENCE_FILE, SEALED_FILE};
    use likeness_core::UNKNOWN_PERSON;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> IdentityRegistry {
        IdentityRegistry::open(dir.path(), &EncryptionKey::from_bytes([8u8; 32])).unwrap()
    }

    #[test]
    fn test_enroll_writes_all_three_artifacts() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = reg.enroll("  Alice  ", b"photo-bytes").unwrap();

        assert_eq!(reg.resolve(&id), "Alice");
        let reference = dir.path().join(KNOWN_FACES_DIR).join(&id).join(REFERENCE_FILE);
        let sealed = dir.path().join(ENCRYPTED_FACES_DIR).join(&id).join(SEALED_FILE);
        assert_eq!(std::fs::read(reference).unwrap(), b"photo-bytes");
        assert_ne!(std::fs::read(sealed).unwrap(), b"photo-bytes");
        assert_eq!(reg.sealed_image(&id).unwrap(), b"photo-bytes");
        assert_eq!(reg.count().unwrap(), 1);
    }

    #[test]
    fn test_enroll_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        assert!(matches!(reg.enroll("   ", b"x"), Err(RegistryError::EmptyName)));
        assert!(reg.vault().is_empty());
    }

    #[test]
    fn test_enroll_rolls_back_on_write_failure() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let sealed_root = dir.path().join(ENCRYPTED_FACES_DIR);
        std::fs::remove_dir(&sealed_root).unwrap();
        std::fs::write(&sealed_root, b"not a directory").unwrap();

        assert!(reg.enroll("Bob", b"photo").is_err());
        assert!(reg.vault().is_empty());
        assert_eq!(reg.count().unwrap(), 0);
    }

    #[test]
    fn test_remove_by_name_deletes_everything() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = reg.enroll("Carol", b"photo").unwrap();
        let keep = reg.enroll("Dave", b"other").unwrap();

        assert_eq!(reg.remove_by_name("Carol").unwrap(), id);
        assert_eq!(reg.resolve(&id), UNKNOWN_PERSON);
        assert!(!dir.path().join(KNOWN_FACES_DIR).join(&id).exists());
        assert!(!dir.path().join(ENCRYPTED_FACES_DIR).join(&id).exists());
        assert_eq!(reg.resolve(&keep), "Dave");
        assert_eq!(reg.count().unwrap(), 1);
    }

    #[test]
    fn test_failed_remove_keeps_identity_intact() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = reg.enroll("Carol", b"photo").unwrap();

        // A directory at the temp path makes the mapping write fail.
        let blocker = dir.path().join(format!("{MAPPING_FILE}.tmp"));
        std::fs::create_dir(&blocker).unwrap();

        assert!(reg.remove_by_name("Carol").is_err());
        let reference = dir.path().join(KNOWN_FACES_DIR).join(&id).join(REFERENCE_FILE);
        let sealed = dir.path().join(ENCRYPTED_FACES_DIR).join(&id).join(SEALED_FILE);
        assert_eq!(std::fs::read(&reference).unwrap(), b"photo");
        assert!(sealed.is_file());
        assert_eq!(reg.resolve(&id), "Carol");
        assert_eq!(reg.vault().reverse_lookup("Carol").as_deref(), Some(id.as_str()));
        assert_eq!(reg.list().unwrap().len(), 1);
        assert_eq!(reg.count().unwrap(), 1);
        for root in [KNOWN_FACES_DIR, ENCRYPTED_FACES_DIR] {
            let leftovers = std::fs::read_dir(dir.path().join(root))
                .unwrap()
                .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".removing"))
                .count();
            assert_eq!(leftovers, 0, "{root}");
        }

        std::fs::remove_dir(&blocker).unwrap();
        assert_eq!(reg.remove_by_name("Carol").unwrap(), id);
        assert!(!reference.exists());
        assert!(!sealed.exists());
        assert_eq!(reg.count().unwrap(), 0);
    }

    #[test]
    fn test_remove_by_unknown_name() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.enroll("Erin", b"photo").unwrap();
        assert!(matches!(reg.remove_by_name("erin"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_list_reports_names_and_sizes() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.enroll("Frank", b"12345").unwrap();
        reg.enroll("Grace", b"123").unwrap();

        let faces = reg.list().unwrap();
        assert_eq!(faces.len(), 2);
        let frank = faces.iter().find(|f| f.name == "Frank").unwrap();
        assert_eq!(frank.file_size, 5);
        assert!(faces.windows(2).all(|w| w[0].added_date >= w[1].added_date));
    }

    #[test]
    fn test_references_feed_gallery() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let id = reg.enroll("Heidi", b"ref").unwrap();
        let gallery: Vec<_> = reg.references().unwrap().collect();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery[0].pseudonym_id, id);
        assert_eq!(gallery[0].bytes, b"ref");
    }

    #[test]
    fn test_reopen_keeps_identities() {
        let dir = TempDir::new().unwrap();
        let id = registry(&dir).enroll("Ivan", b"photo").unwrap();
        assert_eq!(registry(&dir).resolve(&id), "Ivan");
    }
}
