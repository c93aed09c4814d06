use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::keys::MasterKey;
use crate::errors::{BudgetVaultError, Result};

/// Environment variable that overrides `master_key` from the config file.
pub const MASTER_KEY_ENV: &str = "BUDGETVAULT_MASTER_KEY";

/// Process-level configuration, loaded from `budgetvault.toml`.
///
/// Every field except the master key has a default, and the master key
/// is normally supplied through `BUDGETVAULT_MASTER_KEY` rather than the
/// file.
#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base64-encoded 32-byte master key.
    #[serde(default)]
    pub master_key: Option<String>,

    /// SQLite database used by the CLI.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// How long a derived DEK stays cached (default: 5 minutes).
    #[serde(default = "default_dek_cache_ttl_secs")]
    pub dek_cache_ttl_secs: u64,

    /// How long a user stays marked as backfilled (default: 24 hours).
    #[serde(default = "default_backfill_ttl_secs")]
    pub backfill_ttl_secs: u64,

    /// Maximum number of users tracked by the backfill trigger.
    #[serde(default = "default_backfill_cache_capacity")]
    pub backfill_cache_capacity: usize,

    /// Work factor recorded for newly created salts.
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    /// Accounts served by the deterministic zero-salt mode.
    #[serde(default)]
    pub demo_users: Vec<String>,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_database_path() -> String {
    "budgetvault.db".to_string()
}

fn default_dek_cache_ttl_secs() -> u64 {
    300
}

fn default_backfill_ttl_secs() -> u64 {
    86_400
}

fn default_backfill_cache_capacity() -> usize {
    1000
}

fn default_kdf_iterations() -> u32 {
    3
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            master_key: None,
            database_path: default_database_path(),
            dek_cache_ttl_secs: default_dek_cache_ttl_secs(),
            backfill_ttl_secs: default_backfill_ttl_secs(),
            backfill_cache_capacity: default_backfill_cache_capacity(),
            kdf_iterations: default_kdf_iterations(),
            demo_users: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("database_path", &self.database_path)
            .field("dek_cache_ttl_secs", &self.dek_cache_ttl_secs)
            .field("backfill_ttl_secs", &self.backfill_ttl_secs)
            .field("backfill_cache_capacity", &self.backfill_cache_capacity)
            .field("kdf_iterations", &self.kdf_iterations)
            .field("demo_users", &self.demo_users)
            .finish()
    }
}

impl Settings {
    /// Name of the config file we look for.
    const FILE_NAME: &'static str = "budgetvault.toml";

    /// Load settings from `<dir>/budgetvault.toml`, then apply
    /// environment overrides.
    ///
    /// A missing file yields defaults; a malformed file is an error.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(Self::FILE_NAME);

        let mut settings = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            toml::from_str(&contents).map_err(|e| {
                BudgetVaultError::Config(format!("Failed to parse {}: {e}", config_path.display()))
            })?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var(MASTER_KEY_ENV) {
            if !key.trim().is_empty() {
                settings.master_key = Some(key);
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values that would disable the caches or the KDF.
    pub fn validate(&self) -> Result<()> {
        if self.backfill_cache_capacity == 0 {
            return Err(BudgetVaultError::Config(
                "backfill_cache_capacity must be at least 1".into(),
            ));
        }
        if self.kdf_iterations == 0 {
            return Err(BudgetVaultError::Config(
                "kdf_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Decode the configured master key, failing if absent or malformed.
    pub fn master_key(&self) -> Result<MasterKey> {
        MasterKey::from_base64(self.master_key.as_deref())
    }

    pub fn dek_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dek_cache_ttl_secs)
    }

    pub fn backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.backfill_ttl_secs)
    }

    /// Resolve the database path relative to `dir` unless absolute.
    pub fn database_path(&self, dir: &Path) -> PathBuf {
        let path = Path::new(&self.database_path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
