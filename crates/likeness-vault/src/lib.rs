//! likeness-vault — Encrypted identity storage.
//!
//! Display names never touch disk in plaintext: each enrolled identity is
//! keyed by a random pseudonym id, and the name is sealed with AES-256-GCM
//! under a single process-wide key.

pub mod cipher;
pub mod error;
pub mod key;
pub mod registry;
pub mod store;
pub mod vault;

pub use cipher::ImageCipher;
pub use error::{VaultError, VaultResult};
pub use key::{ActiveKey, EncryptionKey, KeyManager, KeySource, KEY_ENV_VAR};
pub use registry::{IdentityRegistry, KnownFace, RegistryError};
pub use store::ArtifactStore;
pub use vault::IdentityVault;
