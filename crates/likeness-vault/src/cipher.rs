//! Authenticated symmetric encryption for names and image blobs.
//!
//! Sealed layout: `version (1) || nonce (12) || ciphertext || tag (16)`.
//! Every seal draws a fresh random nonce, so sealing the same plaintext twice
//! yields different outputs.

use crate::error::{VaultError, VaultResult};
use crate::key::EncryptionKey;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

const FORMAT_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN;

#[derive(Clone)]
pub struct ImageCipher {
    cipher: Aes256Gcm,
}

impl ImageCipher {
    pub fn new(key: &EncryptionKey) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key.expose());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| VaultError::Encrypt)?;

        let mut sealed = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        sealed.push(FORMAT_VERSION);
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> VaultResult<Vec<u8>> {
        if sealed.len() < HEADER_LEN + TAG_LEN {
            return Err(VaultError::Decrypt("ciphertext too short"));
        }
        let (header, body) = sealed.split_at(HEADER_LEN);
        if header[0] != FORMAT_VERSION {
            return Err(VaultError::Decrypt("unsupported format version"));
        }
        let nonce = Nonce::from_slice(&header[1..]);
        self.cipher
            .decrypt(nonce, body)
            .map_err(|_| VaultError::Decrypt("authentication failed"))
    }

    /// Seal a UTF-8 string into a base64url token.
    pub fn seal_text(&self, text: &str) -> VaultResult<String> {
        Ok(URL_SAFE.encode(self.seal(text.as_bytes())?))
    }

    pub fn open_text(&self, token: &str) -> VaultResult<String> {
        let sealed = URL_SAFE
            .decode(token)
            .map_err(|_| VaultError::Decrypt("token is not base64url"))?;
        let plaintext = self.open(&sealed)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt("plaintext is not UTF-8"))
    }
}
