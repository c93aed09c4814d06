//! Secret key material held in memory.
//!
//! Every type here wraps exactly 32 bytes, zeroes its buffer when
//! dropped, and redacts itself in `Debug` output.  Ownership is the
//! scrub boundary: when the operation that produced a key returns (or
//! fails), the key is dropped and its memory is overwritten.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::errors::{BudgetVaultError, Result};

/// Length of every key handled by this crate (256 bits).
pub const KEY_LEN: usize = 32;

/// Copy a slice into a fixed-size key buffer, checking the length.
fn key_bytes_from_slice(bytes: &[u8]) -> Result<[u8; KEY_LEN]> {
    if bytes.len() != KEY_LEN {
        return Err(BudgetVaultError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        });
    }
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn random_key_bytes() -> [u8; KEY_LEN] {
    let mut bytes = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

// ---------------------------------------------------------------------------
// MasterKey
// ---------------------------------------------------------------------------

/// The process-wide server secret mixed into every DEK derivation.
///
/// Loaded once at startup from configuration and never persisted by
/// this crate.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Decode a base64 master key from configuration.
    ///
    /// Fails with a configuration error if the value is absent, is not
    /// valid base64, or does not decode to exactly 32 bytes.
    pub fn from_base64(encoded: Option<&str>) -> Result<Self> {
        let encoded = encoded
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BudgetVaultError::Config("master key is not configured".into()))?;

        let decoded = Zeroizing::new(
            BASE64
                .decode(encoded)
                .map_err(|e| BudgetVaultError::Config(format!("master key is not base64: {e}")))?,
        );

        let bytes = key_bytes_from_slice(&decoded).map_err(|_| {
            BudgetVaultError::Config(format!(
                "master key must decode to {KEY_LEN} bytes, got {}",
                decoded.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Generate a fresh random master key (used by `gen-master-key`).
    pub fn generate() -> Self {
        Self {
            bytes: random_key_bytes(),
        }
    }

    /// Base64 form suitable for `BUDGETVAULT_MASTER_KEY`.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(BASE64.encode(self.bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// ClientSecret
// ---------------------------------------------------------------------------

/// The per-request secret a client derives from the user's password
/// or vault code.  Never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ClientSecret {
    bytes: [u8; KEY_LEN],
}

impl ClientSecret {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bytes: key_bytes_from_slice(bytes)?,
        })
    }

    /// Decode a base64 client secret as sent by a client.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            BudgetVaultError::InvalidCiphertext(format!("client secret is not base64: {e}"))
        })?);
        Self::from_slice(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// Dek
// ---------------------------------------------------------------------------

/// Data Encryption Key: the symmetric key that encrypts amounts.
///
/// `Clone` is needed because the DEK cache hands out copies; every
/// copy is zeroed independently when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek {
    bytes: [u8; KEY_LEN],
}

impl Dek {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bytes: key_bytes_from_slice(bytes)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// RecoveryKey
// ---------------------------------------------------------------------------

/// Raw recovery key bytes.  Shown to the user once in formatted form,
/// never persisted raw.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey {
    bytes: [u8; KEY_LEN],
}

impl RecoveryKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        Self {
            bytes: random_key_bytes(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            bytes: key_bytes_from_slice(bytes)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey([REDACTED])")
    }
}
