use std::path::PathBuf;
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    /// A supplied encryption key could not be decoded.
    #[error("invalid encryption key: {0}")]
    Config(String),
    #[error("persistence failed for {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mapping store {} is corrupt: {source}", .path.display())]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    /// Ciphertext is malformed, tampered with, or sealed under another key.
    #[error("decryption failed: {0}")]
    Decrypt(&'static str),
    #[error("encryption failed")]
    Encrypt,
    #[error("invalid pseudonym id: {0:?}")]
    InvalidId(String),
}

impl VaultError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        VaultError::Persistence {
            path: path.into(),
            source,
        }
    }
}
