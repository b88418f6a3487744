//! Encryption key supply and generation.
//!
//! The key is read once at startup from an externally supplied base64url
//! value. When none is supplied, or it does not decode, a fresh key is
//! derived with PBKDF2-HMAC-SHA256 from a random salt and random passphrase,
//! and setup instructions are appended to a plaintext example-configuration
//! file. A generated key that is never promoted to the supplied value is lost
//! on restart, and anything sealed under it becomes unreadable.

use crate::error::{VaultError, VaultResult};
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const PASSPHRASE_LEN: usize = 32;
pub const KDF_ITERATIONS: u32 = 100_000;

/// Environment variable holding the authoritative key.
pub const KEY_ENV_VAR: &str = "LIKENESS_ENCRYPTION_KEY";

/// 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Padded base64url, the form operators copy into configuration.
    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.0)
    }

    /// Decode a base64url key (padded or unpadded) of exactly 32 bytes.
    pub fn decode(text: &str) -> VaultResult<Self> {
        let text = text.trim();
        let mut bytes = URL_SAFE
            .decode(text)
            .or_else(|_| URL_SAFE_NO_PAD.decode(text))
            .map_err(|e| VaultError::Config(format!("not base64url: {e}")))?;

        let key = <[u8; KEY_LEN]>::try_from(bytes.as_slice())
            .map(Self)
            .map_err(|_| VaultError::Config(format!("expected {KEY_LEN} bytes, got {}", bytes.len())));
        bytes.zeroize();
        key
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Supplied,
    Generated,
}

/// The single key in force for this process.
#[derive(Debug)]
pub struct ActiveKey {
    pub key: EncryptionKey,
    pub source: KeySource,
}

/// Derive a key from a passphrase and salt with PBKDF2-HMAC-SHA256.
pub fn derive_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> EncryptionKey {
    let mut out = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut out);
    let key = EncryptionKey(out);
    out.zeroize();
    key
}

/// Fresh key from a random salt and random passphrase.
pub fn generate_key() -> EncryptionKey {
    let mut salt = [0u8; SALT_LEN];
    let mut passphrase = [0u8; PASSPHRASE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut passphrase);

    let key = derive_key(&passphrase, &salt, KDF_ITERATIONS);
    passphrase.zeroize();
    key
}

pub struct KeyManager {
    instructions_path: PathBuf,
}

impl KeyManager {
    /// `instructions_path` is the example-configuration file that receives
    /// setup text for generated keys. It is never the live configuration.
    pub fn new(instructions_path: impl Into<PathBuf>) -> Self {
        Self {
            instructions_path: instructions_path.into(),
        }
    }

    pub fn instructions_path(&self) -> &Path {
        &self.instructions_path
    }

    /// Use the supplied key if it decodes, otherwise generate one.
    pub fn load_or_create(&self, supplied: Option<&str>) -> ActiveKey {
        if let Some(text) = supplied.map(str::trim).filter(|t| !t.is_empty()) {
            match EncryptionKey::decode(text) {
                Ok(key) => {
                    tracing::info!("using supplied encryption key");
                    return ActiveKey {
                        key,
                        source: KeySource::Supplied,
                    };
                }
                Err(e) => {
                    tracing::error!(error = %e, "supplied encryption key unusable; generating a new one");
                }
            }
        }

        let key = generate_key();
        match self.write_instructions(&key) {
            Ok(()) => tracing::warn!(
                path = %self.instructions_path.display(),
                "generated a new encryption key; copy {KEY_ENV_VAR} from this file into the live configuration or data sealed under it is lost on restart"
            ),
            Err(e) => tracing::error!(
                path = %self.instructions_path.display(),
                error = %e,
                "generated a new encryption key but could not record it; data sealed under it is lost on restart"
            ),
        }

        ActiveKey {
            key,
            source: KeySource::Generated,
        }
    }

    fn write_instructions(&self, key: &EncryptionKey) -> std::io::Result<()> {
        if let Some(parent) = self.instructions_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.instructions_path)?;
        writeln!(file)?;
        writeln!(file, "# Add this to your environment or config file:")?;
        writeln!(file, "{KEY_ENV_VAR}={}", key.encode())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = EncryptionKey::from_bytes([7u8; KEY_LEN]);
        let decoded = EncryptionKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded.expose(), key.expose());
    }

    #[test]
    fn test_decode_accepts_unpadded() {
        let text = URL_SAFE_NO_PAD.encode([9u8; KEY_LEN]);
        assert_eq!(EncryptionKey::decode(&text).unwrap().expose(), &[9u8; KEY_LEN]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let text = URL_SAFE.encode([1u8; 16]);
        assert!(matches!(EncryptionKey::decode(&text), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(EncryptionKey::decode("not a key!!"), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = EncryptionKey::from_bytes([3u8; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "EncryptionKey(..)");
    }

    #[test]
    fn test_derive_key_deterministic_per_salt() {
        let a = derive_key(b"passphrase", b"salt-one", 1_000);
        let b = derive_key(b"passphrase", b"salt-one", 1_000);
        let c = derive_key(b"passphrase", b"salt-two", 1_000);
        assert_eq!(a.expose(), b.expose());
        assert_ne!(a.expose(), c.expose());
    }

    #[test]
    fn test_supplied_key_is_used_without_instructions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("likeness.env.example");
        let supplied = EncryptionKey::from_bytes([5u8; KEY_LEN]).encode();

        let active = KeyManager::new(&path).load_or_create(Some(&supplied));

        assert_eq!(active.source, KeySource::Supplied);
        assert_eq!(active.key.expose(), &[5u8; KEY_LEN]);
        assert!(!path.exists());
    }

    #[test]
    fn test_invalid_supplied_key_falls_back_to_generation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("likeness.env.example");

        let active = KeyManager::new(&path).load_or_create(Some("definitely-not-a-key"));

        assert_eq!(active.source, KeySource::Generated);
        let text = std::fs::read_to_string(&path).unwrap();
        let line = format!("{KEY_ENV_VAR}={}", active.key.encode());
        assert!(text.contains(&line));
    }

    #[test]
    fn test_generated_instructions_are_appended() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("likeness.env.example");
        std::fs::write(&path, "# existing content\n").unwrap();

        let active = KeyManager::new(&path).load_or_create(None);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# existing content\n"));
        assert!(text.contains(&active.key.encode()));
        assert!(EncryptionKey::decode(&active.key.encode()).is_ok());
    }
}
