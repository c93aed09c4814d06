//! Key derivation.
//!
//! - DEK derivation: HKDF-SHA256 over `client_secret || master_key`,
//!   salted with the user's salt and bound to the user id via `info`.
//! - Cache fingerprints: truncated HMAC-SHA256 of the client secret.
//! - Client-secret derivation: Argon2id from a password, the same work a
//!   client performs before calling the backend.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::crypto::keys::{ClientSecret, Dek, MasterKey, KEY_LEN};
use crate::errors::{BudgetVaultError, Result};

/// Length of a per-user salt in bytes (128 bits).
pub const SALT_LEN: usize = 16;

/// Length of a cache fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 16;

/// Salt used for accounts in deterministic demo mode.
pub const DEMO_SALT: [u8; SALT_LEN] = [0u8; SALT_LEN];

/// Argon2 memory cost for client-secret derivation (64 MB).
const CLIENT_MEMORY_KIB: u32 = 65_536;

/// Argon2 lanes for client-secret derivation.
const CLIENT_PARALLELISM: u32 = 4;

/// Generate a cryptographically random per-user salt.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Derive the DEK for `user_id`.
///
/// The same client secret, master key, salt and user id always produce
/// the same key.
pub fn derive_dek(
    client_secret: &ClientSecret,
    master_key: &MasterKey,
    salt: &[u8],
    user_id: &str,
) -> Result<Dek> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(2 * KEY_LEN));
    ikm.extend_from_slice(client_secret.as_bytes());
    ikm.extend_from_slice(master_key.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(salt), &ikm);
    let info = format!("dek-binding-for-{user_id}");

    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info.as_bytes(), &mut *okm)
        .map_err(|e| BudgetVaultError::KeyDerivationFailed(format!("HKDF expand failed: {e}")))?;

    Ok(Dek::new(*okm))
}

/// One-way fingerprint of a client secret, used only to tell cache
/// entries apart.  Keyed with the master key so it cannot be matched
/// against fingerprints from another deployment.
pub fn fingerprint(master_key: &MasterKey, client_secret: &ClientSecret) -> Result<[u8; FINGERPRINT_LEN]> {
    let mut mac = Hmac::<Sha256>::new_from_slice(master_key.as_bytes())
        .map_err(|e| BudgetVaultError::KeyDerivationFailed(format!("HMAC init failed: {e}")))?;
    mac.update(client_secret.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut out = [0u8; FINGERPRINT_LEN];
    out.copy_from_slice(&digest[..FINGERPRINT_LEN]);
    Ok(out)
}

/// Derive a client secret from a password the way a client does.
///
/// `kdf_iterations` is the work factor recorded in the user's key row.
/// The Argon2 salt is a hash of the user id so each account derives a
/// distinct secret from the same password.
pub fn derive_client_secret(
    password: &[u8],
    user_id: &str,
    kdf_iterations: u32,
) -> Result<ClientSecret> {
    if kdf_iterations < 1 {
        return Err(BudgetVaultError::KeyDerivationFailed(
            "KDF iterations must be at least 1".into(),
        ));
    }

    let params = Params::new(
        CLIENT_MEMORY_KIB,
        kdf_iterations,
        CLIENT_PARALLELISM,
        Some(KEY_LEN),
    )
    .map_err(|e| BudgetVaultError::KeyDerivationFailed(format!("invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = Sha256::digest(format!("budgetvault-client:{user_id}").as_bytes());

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(password, &salt[..SALT_LEN], &mut *key)
        .map_err(|e| BudgetVaultError::KeyDerivationFailed(format!("Argon2id hashing failed: {e}")))?;

    Ok(ClientSecret::new(*key))
}
