//! CLI module: Clap argument parser, shared context, and command implementations.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use zeroize::Zeroizing;

use crate::config::Settings;
use crate::crypto::kdf::derive_client_secret;
use crate::crypto::keys::ClientSecret;
use crate::errors::{BudgetVaultError, Result};
use crate::manager::KeyManager;
use crate::store::{KeySaltStore, LedgerStore, SqliteStore};

/// Environment variable holding the current client secret (base64).
pub const CLIENT_SECRET_ENV: &str = "BUDGETVAULT_CLIENT_SECRET";

/// Environment variable holding the replacement client secret (base64).
pub const NEW_CLIENT_SECRET_ENV: &str = "BUDGETVAULT_NEW_CLIENT_SECRET";

/// Environment variable holding a recovery key, so it never appears in argv.
pub const RECOVERY_KEY_ENV: &str = "BUDGETVAULT_RECOVERY_KEY";

/// Minimum password length accepted when deriving a new client secret.
const MIN_PASSWORD_LEN: usize = 8;

/// BudgetVault operator CLI: per-user encryption of budgeting amounts.
#[derive(Parser)]
#[command(
    name = "budgetvault",
    about = "Per-user envelope encryption for budgeting data",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding budgetvault.toml (default: current directory)
    #[arg(long, default_value = ".", global = true)]
    pub dir: String,

    /// SQLite database path (overrides `database_path` from the config)
    #[arg(long, global = true)]
    pub database: Option<String>,
}

/// All available subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate a new random master key (base64)
    GenMasterKey,

    /// Encrypt a user's remaining plaintext amounts
    Backfill {
        /// User id
        user: String,
        /// Print the batch that would be written instead of writing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show encrypted vs plaintext row counts for a user
    Status {
        /// User id
        user: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a client secret against the user's key check
    Verify {
        /// User id
        user: String,
    },

    /// Create a recovery key for a user
    SetupRecovery {
        /// User id
        user: String,
    },

    /// Regain access with a recovery key and a new client secret
    ///
    /// The recovery key is read from BUDGETVAULT_RECOVERY_KEY, or prompted for.
    Recover {
        /// User id
        user: String,
    },

    /// Change a user's client secret and re-encrypt all their data
    ChangeSecret {
        /// User id
        user: String,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers used by multiple commands
// ---------------------------------------------------------------------------

/// Settings and storage opened from the CLI arguments.
pub struct Context {
    pub settings: Settings,
    pub store: Arc<SqliteStore>,
}

impl Context {
    /// Load `budgetvault.toml` from `--dir` and open the database.
    pub fn load(cli: &Cli) -> Result<Self> {
        let dir = Path::new(&cli.dir);
        let settings = Settings::load(dir)?;
        let db_path = match &cli.database {
            Some(path) => PathBuf::from(path),
            None => settings.database_path(dir),
        };
        let store = Arc::new(SqliteStore::open(&db_path)?);
        Ok(Self { settings, store })
    }

    /// Build a key manager over this context's store.
    ///
    /// Fails with a configuration error if no valid master key is set.
    pub fn manager(&self) -> Result<KeyManager> {
        let keys: Arc<dyn KeySaltStore> = self.store.clone();
        KeyManager::from_settings(&self.settings, keys)
    }

    pub fn ledger(&self) -> Arc<dyn LedgerStore> {
        self.store.clone()
    }

    /// Work factor for deriving this user's client secret from a password.
    pub async fn kdf_iterations(&self, user_id: &str) -> Result<u32> {
        Ok(self
            .store
            .find_user_key_row(user_id)
            .await?
            .map(|row| row.kdf_iterations)
            .unwrap_or(self.settings.kdf_iterations))
    }
}

/// Single-threaded runtime for one CLI command.
pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(BudgetVaultError::Io)
}

/// Get the user's current client secret, trying in order:
/// 1. `BUDGETVAULT_CLIENT_SECRET` env var (base64, scripted use)
/// 2. Interactive password prompt, derived the way clients derive it
pub fn prompt_client_secret(user_id: &str, kdf_iterations: u32) -> Result<ClientSecret> {
    if let Some(secret) = client_secret_from_env(CLIENT_SECRET_ENV)? {
        return Ok(secret);
    }

    let pw = dialoguer::Password::new()
        .with_prompt(format!("Password for '{user_id}'"))
        .interact()
        .map_err(|e| BudgetVaultError::CommandFailed(format!("password prompt: {e}")))?;
    let pw = Zeroizing::new(pw);
    derive_client_secret(pw.as_bytes(), user_id, kdf_iterations)
}

/// Get a replacement client secret, trying in order:
/// 1. `BUDGETVAULT_NEW_CLIENT_SECRET` env var (base64)
/// 2. Interactive prompt with confirmation
pub fn prompt_new_client_secret(user_id: &str, kdf_iterations: u32) -> Result<ClientSecret> {
    if let Some(secret) = client_secret_from_env(NEW_CLIENT_SECRET_ENV)? {
        return Ok(secret);
    }

    loop {
        let pw = dialoguer::Password::new()
            .with_prompt(format!("New password for '{user_id}'"))
            .with_confirmation("Confirm new password", "Passwords do not match, try again")
            .interact()
            .map_err(|e| BudgetVaultError::CommandFailed(format!("password prompt: {e}")))?;
        let pw = Zeroizing::new(pw);

        if pw.len() < MIN_PASSWORD_LEN {
            output::warning(&format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters. Try again."
            ));
            continue;
        }

        return derive_client_secret(pw.as_bytes(), user_id, kdf_iterations);
    }
}

/// Get a recovery key from `BUDGETVAULT_RECOVERY_KEY`, or prompt for it.
pub fn prompt_recovery_key() -> Result<Zeroizing<String>> {
    if let Ok(value) = std::env::var(RECOVERY_KEY_ENV) {
        if !value.trim().is_empty() {
            return Ok(Zeroizing::new(value));
        }
    }

    let key = dialoguer::Password::new()
        .with_prompt("Recovery key")
        .interact()
        .map_err(|e| BudgetVaultError::CommandFailed(format!("recovery key prompt: {e}")))?;
    Ok(Zeroizing::new(key))
}

/// Read a base64 client secret from `var`, if set and non-empty.
fn client_secret_from_env(var: &str) -> Result<Option<ClientSecret>> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            let value = Zeroizing::new(value);
            ClientSecret::from_base64(value.trim())
                .map(Some)
                .map_err(|e| BudgetVaultError::Config(format!("{var}: {e}")))
        }
        _ => Ok(None),
    }
}
