//! Amount codec: monetary values to and from `EncryptedAmount` strings.
//!
//! An amount is encrypted as its canonical decimal string.  Rust's
//! `Display` for `f64` prints the shortest string that parses back to
//! the same value, so the round trip is exact for every finite amount.

use zeroize::Zeroizing;

use crate::crypto::encryption::{open, seal};
use crate::crypto::keys::Dek;
use crate::errors::{BudgetVaultError, Result};

/// Canonical decimal form of an amount.
fn canonical_decimal(amount: f64) -> Result<Zeroizing<String>> {
    if !amount.is_finite() {
        return Err(BudgetVaultError::EncryptionFailed(
            "amount must be a finite number".into(),
        ));
    }
    Ok(Zeroizing::new(amount.to_string()))
}

fn parse_decimal(bytes: &[u8]) -> Result<f64> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| BudgetVaultError::InvalidAmount("payload is not UTF-8".into()))?;
    let value: f64 = text
        .trim()
        .parse()
        .map_err(|_| BudgetVaultError::InvalidAmount("payload is not a number".into()))?;
    if !value.is_finite() {
        return Err(BudgetVaultError::InvalidAmount(
            "payload is not a finite number".into(),
        ));
    }
    Ok(value)
}

/// Encrypt an amount under `dek`, returning base64 `IV || tag || ciphertext`.
///
/// A fresh IV is drawn per call, so equal amounts encrypt differently.
pub fn encrypt_amount(amount: f64, dek: &Dek) -> Result<String> {
    let decimal = canonical_decimal(amount)?;
    seal(dek.as_bytes(), decimal.as_bytes())
}

/// Decrypt an amount.  Fails on bad base64, tag mismatch, or a payload
/// that is not a finite number; never substitutes a default.
pub fn decrypt_amount(ciphertext: &str, dek: &Dek) -> Result<f64> {
    let plaintext = open(dek.as_bytes(), ciphertext)?;
    parse_decimal(&plaintext)
}

/// Lenient decrypt: returns `fallback` on any failure.
///
/// Meant for reads of data that may still be under a rotated key.  The
/// warning carries only the ciphertext length and the fallback value.
pub fn try_decrypt_amount(ciphertext: &str, dek: &Dek, fallback: f64) -> f64 {
    match decrypt_amount(ciphertext, dek) {
        Ok(amount) => amount,
        Err(e) => {
            tracing::warn!(
                ciphertext_len = ciphertext.len(),
                fallback,
                error = %e,
                "amount decryption failed, using fallback"
            );
            fallback
        }
    }
}

/// Encrypt a batch of amounts, preserving order.  The first failure aborts.
pub fn encrypt_amounts(amounts: &[f64], dek: &Dek) -> Result<Vec<String>> {
    amounts.iter().map(|a| encrypt_amount(*a, dek)).collect()
}

/// Decrypt a batch of ciphertexts, all-or-nothing.
pub fn decrypt_amounts<S: AsRef<str>>(ciphertexts: &[S], dek: &Dek) -> Result<Vec<f64>> {
    ciphertexts
        .iter()
        .map(|c| decrypt_amount(c.as_ref(), dek))
        .collect()
}
