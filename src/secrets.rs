//! At-rest password handling for monitor credentials.
//!
//! Configured passwords may be stored AES-256-GCM encrypted (hex-encoded
//! `nonce || ciphertext || tag`) when a key file is configured. Decryption
//! happens immediately before a connection attempt and the plaintext buffer
//! is zeroed when the caller drops it.

use std::path::Path;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("Failed to read key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid encryption key: expected {expected} bytes, got {got}")]
    InvalidKey { expected: usize, got: usize },
    #[error("Encryption failure")]
    Crypto,
}

/// Password decryption context. Without a key file every password is taken
/// verbatim.
pub struct Secrets {
    key: Option<LessSafeKey>,
}

impl Secrets {
    /// Passwords are stored in plaintext.
    pub fn plaintext() -> Self {
        Self { key: None }
    }

    /// Load a 32-byte AES-256 key from `path`.
    pub fn from_key_file(path: &Path) -> Result<Self, SecretsError> {
        let bytes = std::fs::read(path)?;
        Self::from_key_bytes(&bytes)
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Result<Self, SecretsError> {
        let unbound = UnboundKey::new(&AES_256_GCM, bytes).map_err(|_| SecretsError::InvalidKey {
            expected: AES_256_GCM.key_len(),
            got: bytes.len(),
        })?;
        Ok(Self {
            key: Some(LessSafeKey::new(unbound)),
        })
    }

    /// Decrypt a configured password into a zero-on-drop buffer.
    ///
    /// A value that does not parse as an encrypted blob is passed through
    /// unchanged, so plaintext passwords keep working alongside a key file.
    pub fn decrypt(&self, value: &str) -> Zeroizing<String> {
        let Some(key) = &self.key else {
            return Zeroizing::new(value.to_string());
        };

        match try_decrypt(key, value) {
            Some(plain) => plain,
            None => {
                if !value.is_empty() {
                    warn!("Password is not in the encrypted format, using it as plaintext");
                }
                Zeroizing::new(value.to_string())
            }
        }
    }

    /// Encrypt a password into the configured hex form.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, SecretsError> {
        let key = self.key.as_ref().ok_or(SecretsError::Crypto)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| SecretsError::Crypto)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| SecretsError::Crypto)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + in_out.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&in_out);
        Ok(to_hex(&blob))
    }
}

fn try_decrypt(key: &LessSafeKey, value: &str) -> Option<Zeroizing<String>> {
    let blob = from_hex(value)?;
    if blob.len() <= NONCE_LEN {
        return None;
    }

    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&blob[..NONCE_LEN]);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = Zeroizing::new(blob[NONCE_LEN..].to_vec());
    let plain = key.open_in_place(nonce, Aad::empty(), &mut in_out[..]).ok()?;
    let text = std::str::from_utf8(plain).ok()?;
    Some(Zeroizing::new(text.to_string()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || text.is_empty() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}
