//! AES-256-GCM encryption for encrypted containers
//!
//! Provides authenticated encryption for entry payloads with:
//! - AES-256-GCM with 96-bit random nonces
//! - 128-bit authentication tags
//! - Container key derived as SHA-256(salt || secret)
//!
//! Format of an encrypted payload: [nonce: 12 bytes][ciphertext][tag: 16 bytes]
//!
//! Secrets come from a [`KeyProvider`], consulted only when a driver reports
//! that a container is encrypted.

use crate::error::{FsError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Encryption key (32 bytes for AES-256)
pub type EncryptionKey = [u8; 32];

/// Nonce size for AES-GCM (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Overhead added by encryption (nonce + tag)
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Salt stored in the container header
pub const SALT_SIZE: usize = 16;

/// Resolves the secret for an encrypted container
pub trait KeyProvider: Send + Sync {
    /// Return the secret for `mount` or fail with `AuthCancelled`
    fn secret(&self, mount: &str) -> Result<Vec<u8>>;
}

/// Never has a secret
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeys;

impl KeyProvider for NoKeys {
    fn secret(&self, mount: &str) -> Result<Vec<u8>> {
        Err(FsError::AuthCancelled(mount.to_string()))
    }
}

/// Secrets configured up front, per mount path with an optional fallback
#[derive(Debug, Default)]
pub struct StaticKeys {
    secrets: RwLock<HashMap<String, Vec<u8>>>,
    fallback: Option<Vec<u8>>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `secret` for every mount without an explicit entry
    pub fn with_default(secret: impl Into<Vec<u8>>) -> Self {
        StaticKeys {
            secrets: RwLock::new(HashMap::new()),
            fallback: Some(secret.into()),
        }
    }

    pub fn insert(&self, mount: impl Into<String>, secret: impl Into<Vec<u8>>) {
        self.secrets.write().insert(mount.into(), secret.into());
    }
}

impl KeyProvider for StaticKeys {
    fn secret(&self, mount: &str) -> Result<Vec<u8>> {
        if let Some(secret) = self.secrets.read().get(mount) {
            return Ok(secret.clone());
        }
        self.fallback
            .clone()
            .ok_or_else(|| FsError::AuthCancelled(mount.to_string()))
    }
}

/// Derive the container key from its salt and the user secret
pub fn derive_key(salt: &[u8], secret: &[u8]) -> EncryptionKey {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(secret);
    hasher.finalize().into()
}

/// Short, non-secret fingerprint of a key, used to match codec states
pub fn fingerprint(key: &EncryptionKey) -> String {
    let digest = Sha256::digest(key);
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Generate a random salt
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypt data using AES-256-GCM
///
/// Returns encrypted data with format: [nonce][ciphertext][tag]
pub fn encrypt(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, data).map_err(|e| {
        FsError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Encryption failed: {}", e),
        ))
    })?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt data using AES-256-GCM
///
/// Expects data in format: [nonce][ciphertext][tag]
pub fn decrypt(data: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    if data.len() < ENCRYPTION_OVERHEAD {
        return Err(FsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Encrypted data too short",
        )));
    }

    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

    cipher.decrypt(nonce, &data[NONCE_SIZE..]).map_err(|e| {
        FsError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Decryption failed: {}", e),
        ))
    })
}
