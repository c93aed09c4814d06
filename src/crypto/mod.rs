//! Cryptographic primitives for BudgetVault.
//!
//! This module provides:
//! - AES-256-GCM encryption and decryption (`encryption`)
//! - Zeroizing key types (`keys`)
//! - HKDF DEK derivation, cache fingerprints and Argon2id client secrets (`kdf`)
//! - The encrypted amount codec (`amount`)
//! - Recovery keys and DEK wrapping (`recovery`)

pub mod amount;
pub mod encryption;
pub mod kdf;
pub mod keys;
pub mod recovery;

pub use amount::{decrypt_amount, decrypt_amounts, encrypt_amount, encrypt_amounts, try_decrypt_amount};
pub use encryption::{decrypt, encrypt};
pub use kdf::{derive_client_secret, derive_dek, fingerprint, generate_salt, SALT_LEN};
pub use keys::{ClientSecret, Dek, MasterKey, RecoveryKey, KEY_LEN};
pub use recovery::{format_recovery_key, generate_recovery_key, parse_recovery_key, unwrap_dek, wrap_dek};
