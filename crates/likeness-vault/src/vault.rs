//! Pseudonym mapping: opaque id -> sealed display name.
//!
//! The mapping is persisted as a single JSON object and rewritten wholesale
//! on each mutation, under the write lock, via temp file and rename. A
//! mutation whose persistence fails leaves the in-memory map unchanged.

use crate::cipher::ImageCipher;
use crate::error::{VaultError, VaultResult};
use crate::store::write_atomic;
use likeness_core::{NameResolver, UNKNOWN_PERSON};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// File name of the mapping store inside the data directory.
pub const MAPPING_FILE: &str = "encryption_mapping.json";

pub struct IdentityVault {
    path: PathBuf,
    cipher: Arc<ImageCipher>,
    entries: RwLock<BTreeMap<String, String>>,
}

impl IdentityVault {
    /// Load the mapping at `path`, or start empty if the file does not exist.
    /// A file that exists but does not parse is an error.
    pub fn open(path: impl Into<PathBuf>, cipher: Arc<ImageCipher>) -> VaultResult<Self> {
        let path = path.into();
        let entries = load_mapping(&path)?;
        tracing::info!(path = %path.display(), entries = entries.len(), "identity vault opened");
        Ok(Self {
            path,
            cipher,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal `display_name` under a fresh random id and persist the mapping.
    pub fn pseudonymize(&self, display_name: &str) -> VaultResult<String> {
        let sealed = self.cipher.seal_text(display_name)?;
        let id = Uuid::new_v4().to_string();

        let mut entries = self.entries.write();
        entries.insert(id.clone(), sealed);
        if let Err(e) = persist(&self.path, &entries) {
            entries.remove(&id);
            return Err(e);
        }
        drop(entries);

        tracing::debug!(id = %id, "pseudonym created");
        Ok(id)
    }

    /// Recover the display name for `id`, or `"Unknown"`.
    pub fn resolve(&self, id: &str) -> String {
        let token = self.entries.read().get(id).cloned();
        let Some(token) = token else {
            tracing::debug!(id = %id, "pseudonym not in mapping");
            return UNKNOWN_PERSON.to_string();
        };

        match self.cipher.open_text(&token) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "mapping entry does not decrypt under the active key");
                UNKNOWN_PERSON.to_string()
            }
        }
    }

    /// Delete the mapping entry. Returns whether it existed.
    pub fn forget(&self, id: &str) -> VaultResult<bool> {
        let mut entries = self.entries.write();
        let Some(previous) = entries.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = persist(&self.path, &entries) {
            entries.insert(id.to_string(), previous);
            return Err(e);
        }
        tracing::debug!(id = %id, "pseudonym forgotten");
        Ok(true)
    }

    /// First id, in id order, whose entry decrypts to exactly `display_name`.
    /// Entries that do not decrypt are skipped.
    pub fn reverse_lookup(&self, display_name: &str) -> Option<String> {
        let snapshot = self.entries.read().clone();
        snapshot
            .into_iter()
            .find(|(_, token)| {
                self.cipher
                    .open_text(token)
                    .map(|name| name == display_name)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl NameResolver for IdentityVault {
    fn resolve(&self, pseudonym_id: &str) -> String {
        IdentityVault::resolve(self, pseudonym_id)
    }
}

fn load_mapping(path: &Path) -> VaultResult<BTreeMap<String, String>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(VaultError::persistence(path, e)),
    };
    serde_json::from_str(&text).map_err(|source| VaultError::CorruptStore {
        path: path.to_path_buf(),
        source,
    })
}

fn persist(path: &Path, entries: &BTreeMap<String, String>) -> VaultResult<()> {
    let json = serde_json::to_vec_pretty(entries)
        .map_err(|e| VaultError::persistence(path, std::io::Error::other(e)))?;
    write_atomic(path, &json).map_err(|e| VaultError::persistence(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::EncryptionKey;
    use tempfile::TempDir;

    fn cipher(byte: u8) -> Arc<ImageCipher> {
        Arc::new(ImageCipher::new(&EncryptionKey::from_bytes([byte; 32])))
    }

    fn vault(dir: &TempDir) -> IdentityVault {
        IdentityVault::open(dir.path().join(MAPPING_FILE), cipher(1)).unwrap()
    }

    #[test]
    fn test_pseudonymize_then_resolve() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);
        let id = v.pseudonymize("Ada Lovelace").unwrap();
        assert_eq!(v.resolve(&id), "Ada Lovelace");
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn test_same_name_gets_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);
        let a = v.pseudonymize("Alice").unwrap();
        let b = v.pseudonymize("Alice").unwrap();
        assert_ne!(a, b);
        assert_eq!(v.resolve(&a), "Alice");
        assert_eq!(v.resolve(&b), "Alice");
    }

    #[test]
    fn test_unknown_id_resolves_to_unknown() {
        let dir = TempDir::new().unwrap();
        assert_eq!(vault(&dir).resolve("missing"), UNKNOWN_PERSON);
    }

    #[test]
    fn test_mapping_file_never_holds_plaintext() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);
        let id = v.pseudonymize("Grace Hopper").unwrap();
        let text = std::fs::read_to_string(dir.path().join(MAPPING_FILE)).unwrap();
        assert!(text.contains(&id));
        assert!(!text.contains("Grace"));
    }

    #[test]
    fn test_reload_with_same_key() {
        let dir = TempDir::new().unwrap();
        let id = vault(&dir).pseudonymize("Alan").unwrap();
        let reopened = vault(&dir);
        assert_eq!(reopened.resolve(&id), "Alan");
    }

    #[test]
    fn test_reload_with_other_key_is_unknown() {
        let dir = TempDir::new().unwrap();
        let id = vault(&dir).pseudonymize("Alan").unwrap();
        let other = IdentityVault::open(dir.path().join(MAPPING_FILE), cipher(2)).unwrap();
        assert!(other.contains(&id));
        assert_eq!(other.resolve(&id), UNKNOWN_PERSON);
        assert_eq!(other.reverse_lookup("Alan"), None);
    }

    #[test]
    fn test_forget() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);
        let id = v.pseudonymize("Bob").unwrap();
        assert!(v.forget(&id).unwrap());
        assert!(!v.forget(&id).unwrap());
        assert_eq!(v.resolve(&id), UNKNOWN_PERSON);
        assert!(vault(&dir).is_empty());
    }

    #[test]
    fn test_reverse_lookup_returns_first_in_id_order() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);
        let a = v.pseudonymize("Carol").unwrap();
        let b = v.pseudonymize("Carol").unwrap();
        v.pseudonymize("Dave").unwrap();
        let expected = a.min(b);
        assert_eq!(v.reverse_lookup("Carol"), Some(expected));
        assert_eq!(v.reverse_lookup("carol"), None);
    }

    #[test]
    fn test_corrupt_mapping_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(MAPPING_FILE), "{ not json").unwrap();
        let result = IdentityVault::open(dir.path().join(MAPPING_FILE), cipher(1));
        assert!(matches!(result, Err(VaultError::CorruptStore { .. })));
    }

    #[test]
    fn test_failed_persist_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);
        let kept = v.pseudonymize("Eve").unwrap();

        // A directory squatting on the temp path makes the rewrite fail.
        std::fs::create_dir(dir.path().join(format!("{MAPPING_FILE}.tmp"))).unwrap();

        assert!(matches!(v.pseudonymize("Mallory"), Err(VaultError::Persistence { .. })));
        assert!(matches!(v.forget(&kept), Err(VaultError::Persistence { .. })));
        assert_eq!(v.ids(), vec![kept.clone()]);
        assert_eq!(v.resolve(&kept), "Eve");
    }

    #[test]
    fn test_concurrent_writers_lose_no_updates() {
        let dir = TempDir::new().unwrap();
        let v = vault(&dir);

        let ids: Vec<(String, String)> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|t| {
                    let v = &v;
                    s.spawn(move || {
                        (0..20)
                            .map(|i| {
                                let name = format!("person-{t}-{i}");
                                (v.pseudonymize(&name).unwrap(), name)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(v.len(), 160);

        // Forget every other entry concurrently as well.
        std::thread::scope(|s| {
            for chunk in ids.chunks(20) {
                let v = &v;
                s.spawn(move || {
                    for (id, _) in chunk.iter().step_by(2) {
                        assert!(v.forget(id).unwrap());
                    }
                });
            }
        });

        let reopened = vault(&dir);
        assert_eq!(reopened.len(), 80);
        for (n, (id, name)) in ids.iter().enumerate() {
            if n % 2 == 0 {
                assert!(!reopened.contains(id));
            } else {
                assert_eq!(&reopened.resolve(id), name);
            }
        }
    }
}
