//! Per-identity artifact directories.
//!
//! Layout: `<root>/<pseudonym_id>/<file_name>`. Directory names are
//! pseudonym ids only, so the tree never reveals a display name.

use crate::error::{VaultError, VaultResult};
use likeness_core::ReferenceImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Plaintext reference photo used for matching.
pub const REFERENCE_FILE: &str = "reference.img";

/// The same photo sealed under the active key.
pub const SEALED_FILE: &str = "encrypted.bin";

/// Suffix of a directory moved aside while its removal is in flight.
const STAGING_SUFFIX: &str = ".removing";

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    file_name: &'static str,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, file_name: &'static str) -> Self {
        Self {
            root: root.into(),
            file_name,
        }
    }

    pub fn references(root: impl Into<PathBuf>) -> Self {
        Self::new(root, REFERENCE_FILE)
    }

    pub fn sealed(root: impl Into<PathBuf>) -> Self {
        Self::new(root, SEALED_FILE)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &str) -> VaultResult<PathBuf> {
        Ok(self.dir_for(id)?.join(self.file_name))
    }

    fn dir_for(&self, id: &str) -> VaultResult<PathBuf> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\'])
            && !id.contains('\0')
            && !id.ends_with(STAGING_SUFFIX);
        if !valid {
            return Err(VaultError::InvalidId(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    pub fn write(&self, id: &str, bytes: &[u8]) -> VaultResult<()> {
        let path = self.path_for(id)?;
        write_atomic(&path, bytes).map_err(|e| VaultError::persistence(&path, e))
    }

    pub fn read(&self, id: &str) -> VaultResult<Vec<u8>> {
        let path = self.path_for(id)?;
        fs::read(&path).map_err(|e| VaultError::persistence(&path, e))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.path_for(id).map(|p| p.is_file()).unwrap_or(false)
    }

    pub fn metadata(&self, id: &str) -> VaultResult<fs::Metadata> {
        let path = self.path_for(id)?;
        fs::metadata(&path).map_err(|e| VaultError::persistence(&path, e))
    }

    /// Remove the identity's directory. Returns whether anything existed.
    pub fn remove(&self, id: &str) -> VaultResult<bool> {
        let dir = self.dir_for(id)?;
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(VaultError::persistence(&dir, e)),
        }
    }

    /// Move the identity's directory aside, to be purged or restored later.
    /// Returns `None` if there was nothing to move.
    pub fn stage_removal(&self, id: &str) -> VaultResult<Option<PathBuf>> {
        let dir = self.dir_for(id)?;
        let staged = self.root.join(format!("{id}{STAGING_SUFFIX}"));
        // Leftover from an interrupted removal.
        if staged.exists() {
            fs::remove_dir_all(&staged).map_err(|e| VaultError::persistence(&staged, e))?;
        }
        match fs::rename(&dir, &staged) {
            Ok(()) => Ok(Some(staged)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VaultError::persistence(&dir, e)),
        }
    }

    /// Put a staged directory back under its id.
    pub fn restore(&self, id: &str, staged: &Path) -> VaultResult<()> {
        let dir = self.dir_for(id)?;
        fs::rename(staged, &dir).map_err(|e| VaultError::persistence(&dir, e))
    }

    /// Delete a staged directory for good.
    pub fn purge(staged: &Path) -> VaultResult<()> {
        match fs::remove_dir_all(staged) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::persistence(staged, e)),
        }
    }

    /// Ids whose directory holds this store's file, sorted.
    pub fn ids(&self) -> VaultResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VaultError::persistence(&self.root, e)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| VaultError::persistence(&self.root, e))?;
            let Some(id) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if id.ends_with(STAGING_SUFFIX) {
                continue;
            }
            if entry.path().join(self.file_name).is_file() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Lazily read every stored file as a reference image. Unreadable
    /// entries are logged and skipped.
    pub fn reference_images(&self) -> VaultResult<impl Iterator<Item = ReferenceImage> + '_> {
        let ids = self.ids()?;
        Ok(ids.into_iter().filter_map(move |id| match self.read(&id) {
            Ok(bytes) => Some(ReferenceImage {
                pseudonym_id: id,
                bytes,
            }),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "skipping unreadable reference image");
                None
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_remove() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::references(dir.path());

        store.write("abc", b"photo").unwrap();
        assert!(store.contains("abc"));
        assert_eq!(store.read("abc").unwrap(), b"photo");
        assert_eq!(store.path_for("abc").unwrap(), dir.path().join("abc").join(REFERENCE_FILE));

        assert!(store.remove("abc").unwrap());
        assert!(!store.contains("abc"));
        assert!(!store.remove("abc").unwrap());
    }

    #[test]
    fn test_ids_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::references(dir.path());
        store.write("b", b"2").unwrap();
        store.write("a", b"1").unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        assert_eq!(store.ids().unwrap(), vec!["a", "b"]);
        let images: Vec<_> = store.reference_images().unwrap().collect();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].pseudonym_id, "a");
        assert_eq!(images[1].bytes, b"2");
    }

    #[test]
    fn test_staged_directory_is_hidden_until_restored() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::references(dir.path());
        store.write("abc", b"photo").unwrap();

        let staged = store.stage_removal("abc").unwrap().unwrap();
        assert!(!store.contains("abc"));
        assert!(store.ids().unwrap().is_empty());

        store.restore("abc", &staged).unwrap();
        assert_eq!(store.read("abc").unwrap(), b"photo");
        assert_eq!(store.ids().unwrap(), vec!["abc"]);

        let staged = store.stage_removal("abc").unwrap().unwrap();
        ArtifactStore::purge(&staged).unwrap();
        assert!(!staged.exists());
        assert!(store.stage_removal("abc").unwrap().is_none());
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::sealed(dir.path().join("absent"));
        assert!(store.ids().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::references(dir.path());
        for id in ["", ".", "..", "../x", "a/b", "abc.removing"] {
            assert!(matches!(store.write(id, b"x"), Err(VaultError::InvalidId(_))), "{id}");
        }
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, b"{}").unwrap();
        write_atomic(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert!(!dir.path().join("nested").join("file.json.tmp").exists());
    }
}
