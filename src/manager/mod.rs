//! Key & cipher manager.
//!
//! `KeyManager` owns the master key, the DEK cache, and the per-user
//! lock table.  It derives and caches DEKs, manages key-check canaries
//! and recovery keys, and orchestrates credential changes.  Bulk data
//! transformation is delegated to a caller-supplied re-encryption
//! callback (normally `workflows::reencrypt_all_user_data`).

pub mod cache;
pub mod locks;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::crypto::amount::encrypt_amount;
use crate::crypto::encryption::open;
use crate::crypto::kdf::{derive_dek, fingerprint, generate_salt, DEMO_SALT};
use crate::crypto::keys::{ClientSecret, Dek, MasterKey};
use crate::crypto::recovery::{generate_recovery_key, parse_recovery_key, unwrap_dek, wrap_dek};
use crate::errors::{BudgetVaultError, Result};
use crate::store::{KeySaltStore, UserKeyRow};

use cache::DekCache;
use locks::UserLocks;

/// The known value encrypted as a key check.
const KEY_CHECK_VALUE: f64 = 0.0;

/// Tunables for a `KeyManager`.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// How long a derived DEK stays cached.
    pub dek_cache_ttl: Duration,
    /// Work factor recorded with newly created salts.
    pub kdf_iterations: u32,
    /// Accounts served by the deterministic zero-salt mode.
    pub demo_users: Vec<String>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            dek_cache_ttl: Duration::from_secs(300),
            kdf_iterations: 3,
            demo_users: Vec::new(),
        }
    }
}

impl From<&Settings> for ManagerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            dek_cache_ttl: settings.dek_cache_ttl(),
            kdf_iterations: settings.kdf_iterations,
            demo_users: settings.demo_users.clone(),
        }
    }
}

pub struct KeyManager {
    master_key: MasterKey,
    store: Arc<dyn KeySaltStore>,
    cache: DekCache,
    user_locks: UserLocks,
    kdf_iterations: u32,
    demo_users: HashSet<String>,
}

impl KeyManager {
    pub fn new(master_key: MasterKey, store: Arc<dyn KeySaltStore>, options: ManagerOptions) -> Self {
        Self {
            master_key,
            store,
            cache: DekCache::new(options.dek_cache_ttl),
            user_locks: UserLocks::new(),
            kdf_iterations: options.kdf_iterations,
            demo_users: options.demo_users.into_iter().collect(),
        }
    }

    /// Build a manager from settings.  Fails fast if the master key is
    /// absent or not exactly 32 bytes.
    pub fn from_settings(settings: &Settings, store: Arc<dyn KeySaltStore>) -> Result<Self> {
        let master_key = settings.master_key()?;
        Ok(Self::new(master_key, store, ManagerOptions::from(settings)))
    }

    // ------------------------------------------------------------------
    // DEK derivation
    // ------------------------------------------------------------------

    /// Return the user's DEK, creating their salt on first use.
    pub async fn derive_or_get_dek(&self, user_id: &str, client_secret: &ClientSecret) -> Result<Dek> {
        if let Some(dek) = self.demo_dek(user_id, client_secret) {
            return dek;
        }

        let fp = fingerprint(&self.master_key, client_secret)?;
        if let Some(dek) = self.cache.get(user_id, &fp) {
            debug!(user_id, "DEK cache hit");
            return Ok(dek);
        }

        let epoch = self.cache.epoch();
        let salt = self.ensure_salt(user_id).await?;
        let dek = derive_dek(client_secret, &self.master_key, &salt, user_id)?;
        self.cache.insert(user_id, fp, dek.clone(), epoch);
        debug!(user_id, "DEK derived and cached");
        Ok(dek)
    }

    /// Return the user's DEK, failing with `KeyNotConfigured` if the user
    /// has no salt yet.  Demo accounts use a fixed zero salt and never
    /// touch the store.
    pub async fn get_dek(&self, user_id: &str, client_secret: &ClientSecret) -> Result<Dek> {
        if let Some(dek) = self.demo_dek(user_id, client_secret) {
            return dek;
        }

        let fp = fingerprint(&self.master_key, client_secret)?;
        if let Some(dek) = self.cache.get(user_id, &fp) {
            debug!(user_id, "DEK cache hit");
            return Ok(dek);
        }

        let epoch = self.cache.epoch();
        let row = self.require_key_row(user_id).await?;
        let dek = derive_dek(client_secret, &self.master_key, &row.salt, user_id)?;
        self.cache.insert(user_id, fp, dek.clone(), epoch);
        Ok(dek)
    }

    /// Forget every cached DEK for `user_id`.
    pub fn invalidate_user(&self, user_id: &str) {
        self.cache.invalidate_user(user_id);
        debug!(user_id, "DEK cache invalidated");
    }

    /// Whether `user_id` is served by the zero-salt demo mode.
    pub fn is_demo_user(&self, user_id: &str) -> bool {
        self.demo_users.contains(user_id)
    }

    /// Demo accounts derive from `DEMO_SALT` with no cache or store access.
    fn demo_dek(&self, user_id: &str, client_secret: &ClientSecret) -> Option<Result<Dek>> {
        self.is_demo_user(user_id)
            .then(|| derive_dek(client_secret, &self.master_key, &DEMO_SALT, user_id))
    }

    /// Number of DEKs currently cached.
    pub fn cached_dek_count(&self) -> usize {
        self.cache.len()
    }

    async fn ensure_salt(&self, user_id: &str) -> Result<Vec<u8>> {
        if let Some(row) = self.store.find_user_key_row(user_id).await? {
            return Ok(row.salt);
        }

        let salt = generate_salt();
        self.store
            .insert_salt_if_absent(user_id, &salt, self.kdf_iterations)
            .await?;

        // Re-read: a concurrent request may have inserted first.
        let row = self.store.find_user_key_row(user_id).await?.ok_or_else(|| {
            BudgetVaultError::Store(format!("salt for user {user_id} vanished after insert"))
        })?;
        info!(user_id, "created encryption salt");
        Ok(row.salt)
    }

    async fn require_key_row(&self, user_id: &str) -> Result<UserKeyRow> {
        self.store
            .find_user_key_row(user_id)
            .await?
            .ok_or_else(|| BudgetVaultError::KeyNotConfigured(user_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Key check
    // ------------------------------------------------------------------

    /// Check a derived DEK against the stored key check.
    ///
    /// Returns `false` for a wrong credential.  Accounts that predate key
    /// checks get one created under the current DEK and return `true`.
    /// Demo accounts have nothing stored to check against and always pass.
    pub async fn verify_and_ensure_key_check(
        &self,
        user_id: &str,
        client_secret: &ClientSecret,
    ) -> Result<bool> {
        let dek = self.derive_or_get_dek(user_id, client_secret).await?;
        if self.is_demo_user(user_id) {
            return Ok(true);
        }
        let row = self.require_key_row(user_id).await?;

        match row.key_check {
            Some(check) => {
                let valid = key_check_matches(&check, &dek);
                if !valid {
                    debug!(user_id, "key check mismatch");
                }
                Ok(valid)
            }
            None => {
                let check = encrypt_amount(KEY_CHECK_VALUE, &dek)?;
                self.store.update_key_check(user_id, &check).await?;
                info!(user_id, "created key check");
                Ok(true)
            }
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Create a recovery key for the user and persist the wrapped DEK.
    ///
    /// Only the formatted key is returned; the raw bytes are scrubbed
    /// before this returns.
    pub async fn setup_recovery_key(
        &self,
        user_id: &str,
        client_secret: &ClientSecret,
    ) -> Result<Zeroizing<String>> {
        let dek = self.derive_or_get_dek(user_id, client_secret).await?;
        let row = self.require_key_row(user_id).await?;
        if let Some(check) = &row.key_check {
            if !key_check_matches(check, &dek) {
                return Err(BudgetVaultError::DecryptionFailed);
            }
        }

        let (recovery_key, formatted) = generate_recovery_key();
        let wrapped = wrap_dek(&dek, &recovery_key)?;
        drop(recovery_key);

        self.store.update_wrapped_dek(user_id, Some(&wrapped)).await?;
        info!(user_id, "recovery key configured");
        Ok(formatted)
    }

    /// Regain access with a recovery key after the client secret was lost.
    ///
    /// The new DEK is derived from `new_client_secret` against the
    /// existing salt.  `re_encrypt(old_dek, new_dek)` must move all data
    /// to the new key; afterwards the new DEK is wrapped under the same
    /// recovery key.  Key material is scrubbed on every exit path.
    pub async fn recover_with_key<F, Fut>(
        &self,
        user_id: &str,
        formatted_recovery_key: &str,
        new_client_secret: &ClientSecret,
        re_encrypt: F,
    ) -> Result<()>
    where
        F: FnOnce(Dek, Dek) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _serialized = self.user_locks.lock(user_id).await;

        let row = self.require_key_row(user_id).await?;
        let wrapped = row
            .wrapped_dek
            .as_deref()
            .ok_or_else(|| BudgetVaultError::RecoveryNotConfigured(user_id.to_string()))?;

        let recovery_key = parse_recovery_key(formatted_recovery_key)?;
        let old_dek = unwrap_dek(wrapped, &recovery_key)?;
        let new_dek = derive_dek(new_client_secret, &self.master_key, &row.salt, user_id)?;

        self.invalidate_user(user_id);
        re_encrypt(old_dek.clone(), new_dek.clone()).await?;

        let rewrapped = wrap_dek(&new_dek, &recovery_key)?;
        self.store.update_wrapped_dek(user_id, Some(&rewrapped)).await?;
        let check = encrypt_amount(KEY_CHECK_VALUE, &new_dek)?;
        self.store.update_key_check(user_id, &check).await?;

        info!(user_id, "account recovered with recovery key");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Credential change
    // ------------------------------------------------------------------

    /// Rotate the user's salt and DEK after a credential change.
    ///
    /// Calls for the same user run one at a time.  If `re_encrypt` fails,
    /// the previous salt is written back and the original error returned.
    /// On success the wrapped DEK is cleared: a recovery key made for the
    /// old DEK can no longer be used.
    pub async fn on_password_change<F, Fut>(
        &self,
        user_id: &str,
        old_client_secret: &ClientSecret,
        new_client_secret: &ClientSecret,
        re_encrypt: F,
    ) -> Result<()>
    where
        F: FnOnce(Dek, Dek) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _serialized = self.user_locks.lock(user_id).await;

        let original = self.require_key_row(user_id).await?;
        let old_dek = derive_dek(old_client_secret, &self.master_key, &original.salt, user_id)?;
        if let Some(check) = &original.key_check {
            if !key_check_matches(check, &old_dek) {
                return Err(BudgetVaultError::DecryptionFailed);
            }
        }

        let new_salt = generate_salt();
        self.store.update_salt(user_id, &new_salt).await?;
        let new_dek = derive_dek(new_client_secret, &self.master_key, &new_salt, user_id)?;
        self.invalidate_user(user_id);

        if let Err(e) = re_encrypt(old_dek.clone(), new_dek.clone()).await {
            warn!(user_id, error = %e, "re-encryption failed, restoring previous salt");
            if let Err(rollback) = self.store.update_salt(user_id, &original.salt).await {
                error!(user_id, error = %rollback, "failed to restore previous salt");
            }
            self.invalidate_user(user_id);
            return Err(e);
        }

        self.store.update_wrapped_dek(user_id, None).await?;
        let check = encrypt_amount(KEY_CHECK_VALUE, &new_dek)?;
        self.store.update_key_check(user_id, &check).await?;

        info!(user_id, "encryption key rotated");
        Ok(())
    }
}

/// Whether `check` decrypts under `dek` to the key-check value.
fn key_check_matches(check: &str, dek: &Dek) -> bool {
    match open(dek.as_bytes(), check) {
        Ok(plaintext) => {
            let expected = KEY_CHECK_VALUE.to_string();
            plaintext.as_slice().ct_eq(expected.as_bytes()).into()
        }
        Err(_) => false,
    }
}
