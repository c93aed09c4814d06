//! AES-256-GCM authenticated encryption.
//!
//! Each call to `encrypt` generates a fresh random 12-byte IV.  The
//! authentication tag is detached and stored right after the IV, so the
//! stored layout is:
//!   [ 12-byte IV | 16-byte auth tag | ciphertext ]
//!
//! This layout is read by every deployment that ever wrote data; it
//! must not change without a data migration.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::errors::{BudgetVaultError, Result};

/// Size of the AES-256-GCM IV in bytes.
pub const IV_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` with a 32-byte `key`.
///
/// Returns `IV || tag || ciphertext`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    // Build the cipher from the raw key bytes.
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| BudgetVaultError::EncryptionFailed(format!("invalid key length: {e}")))?;

    // Generate a random 12-byte IV.
    let mut iv = [0u8; IV_LEN];
    rand::rng().fill_bytes(&mut iv);

    // Encrypt in place, keeping the tag separate.
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
        .map_err(|e| BudgetVaultError::EncryptionFailed(format!("encryption error: {e}")))?;

    // IV, then tag, then ciphertext.
    let mut output = Vec::with_capacity(IV_LEN + TAG_LEN + buffer.len());
    output.extend_from_slice(&iv);
    output.extend_from_slice(&tag);
    output.extend_from_slice(&buffer);
    Ok(output)
}

/// Decrypt data produced by `encrypt`.
///
/// The returned plaintext is wiped when dropped.
pub fn decrypt(key: &[u8], payload: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    // Need at least an IV and a tag.
    if payload.len() < IV_LEN + TAG_LEN {
        return Err(BudgetVaultError::DecryptionFailed);
    }

    // Split IV and tag from the ciphertext.
    let (iv, rest) = payload.split_at(IV_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    // Build the cipher from the raw key bytes.
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| BudgetVaultError::DecryptionFailed)?;

    // Decrypt and verify the auth tag.
    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(iv), b"", &mut buffer, Tag::from_slice(tag))
        .map_err(|_| BudgetVaultError::DecryptionFailed)?;

    Ok(buffer)
}

/// Encrypt and base64-encode, the form stored in `*_encrypted` columns.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<String> {
    Ok(BASE64.encode(encrypt(key, plaintext)?))
}

/// Inverse of `seal`.
pub fn open(key: &[u8], encoded: &str) -> Result<Zeroizing<Vec<u8>>> {
    let payload = BASE64
        .decode(encoded)
        .map_err(|e| BudgetVaultError::InvalidCiphertext(format!("not valid base64: {e}")))?;
    decrypt(key, &payload)
}
