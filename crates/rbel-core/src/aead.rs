//! AES-256-GCM helpers used by the decrypting converters.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

/// Size of an AES-256 key.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce.
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Encrypts `plaintext`, returning ciphertext with the tag appended.
///
/// `None` if the key or nonce has the wrong length.
pub fn encrypt(key: &[u8], nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Option<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return None;
    }
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .ok()
}

/// Decrypts ciphertext with appended tag.
///
/// `None` on a length mismatch or authentication failure.
pub fn decrypt(key: &[u8], nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if nonce.len() != NONCE_SIZE || ciphertext.len() < TAG_SIZE {
        return None;
    }
    let cipher = Aes256Gcm::new_from_slice(key).ok()?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .ok()
}
