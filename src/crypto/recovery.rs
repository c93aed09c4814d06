//! Recovery keys and DEK wrapping.
//!
//! A recovery key is 32 random bytes shown to the user once as
//! dash-separated groups of four RFC 4648 base32 characters.  The DEK is
//! wrapped under it with the same AES-256-GCM construction used for
//! amounts, so the user can regain access without the old client secret.

use base32::Alphabet;
use zeroize::Zeroizing;

use crate::crypto::encryption::{open, seal};
use crate::crypto::keys::{Dek, RecoveryKey, KEY_LEN};
use crate::errors::{BudgetVaultError, Result};

const ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

/// Characters per displayed group.
const GROUP_LEN: usize = 4;

/// Generate a new recovery key and its display form.
///
/// The caller must drop the raw key as soon as the DEK is wrapped.
pub fn generate_recovery_key() -> (RecoveryKey, Zeroizing<String>) {
    let key = RecoveryKey::generate();
    let formatted = format_recovery_key(&key);
    (key, formatted)
}

/// Render a recovery key as `ABCD-EFGH-...`.
pub fn format_recovery_key(key: &RecoveryKey) -> Zeroizing<String> {
    let encoded = Zeroizing::new(base32::encode(ALPHABET, key.as_bytes()));
    let mut out = Zeroizing::new(String::with_capacity(encoded.len() + encoded.len() / GROUP_LEN));
    for (i, ch) in encoded.chars().enumerate() {
        if i > 0 && i % GROUP_LEN == 0 {
            out.push('-');
        }
        out.push(ch);
    }
    out
}

/// Parse a recovery key typed by the user.
///
/// Dashes and whitespace are ignored and lowercase is accepted.  Any
/// other deviation is a format error, never a crypto error.
pub fn parse_recovery_key(formatted: &str) -> Result<RecoveryKey> {
    let normalized: Zeroizing<String> = Zeroizing::new(
        formatted
            .chars()
            .filter(|c| *c != '-' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect(),
    );

    if normalized.is_empty() {
        return Err(BudgetVaultError::InvalidRecoveryKey("key is empty".into()));
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c))
    {
        return Err(BudgetVaultError::InvalidRecoveryKey(
            "key contains characters outside the base32 alphabet".into(),
        ));
    }

    let decoded = Zeroizing::new(base32::decode(ALPHABET, &normalized).ok_or_else(|| {
        BudgetVaultError::InvalidRecoveryKey("key is not valid base32".into())
    })?);

    if decoded.len() != KEY_LEN {
        return Err(BudgetVaultError::InvalidRecoveryKey(format!(
            "key must decode to {KEY_LEN} bytes, got {}",
            decoded.len()
        )));
    }

    RecoveryKey::from_slice(&decoded)
}

/// Wrap (encrypt) a DEK under a recovery key.
pub fn wrap_dek(dek: &Dek, recovery_key: &RecoveryKey) -> Result<String> {
    seal(recovery_key.as_bytes(), dek.as_bytes())
}

/// Unwrap a DEK.  A tag mismatch or a plaintext that is not exactly 32
/// bytes is fatal; callers must not retry with the same inputs.
pub fn unwrap_dek(wrapped: &str, recovery_key: &RecoveryKey) -> Result<Dek> {
    let plaintext = open(recovery_key.as_bytes(), wrapped)?;
    Dek::from_slice(&plaintext)
}
