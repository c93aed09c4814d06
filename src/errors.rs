use thiserror::Error;

/// All errors that can occur in BudgetVault.
#[derive(Debug, Error)]
pub enum BudgetVaultError {
    // --- Configuration errors ---
    #[error("Configuration error: {0}")]
    Config(String),

    // --- Not-found errors ---
    #[error("No encryption key configured for user '{0}'")]
    KeyNotConfigured(String),

    #[error("No recovery key configured for user '{0}'")]
    RecoveryNotConfigured(String),

    // --- Crypto errors ---
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Decrypted payload is not a valid amount: {0}")]
    InvalidAmount(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    // --- Recovery key format errors ---
    #[error("Invalid recovery key: {0}")]
    InvalidRecoveryKey(String),

    // --- Data store errors ---
    #[error("Data store error: {0}")]
    Store(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Serialization errors ---
    #[error("Serialization error: {0}")]
    Serialization(String),

    // --- CLI errors ---
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("User cancelled operation")]
    UserCancelled,
}

/// Coarse classification of an error, used by callers to pick a
/// user-facing message without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or malformed startup configuration (fatal).
    Configuration,
    /// A key, salt, or recovery row the operation needs does not exist.
    NotFound,
    /// Authentication tag mismatch, malformed ciphertext, or bad key length.
    Crypto,
    /// The recovery key the user typed could not be decoded.
    RecoveryKeyFormat,
    /// The persistence layer failed.
    Store,
    Other,
}

impl BudgetVaultError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::KeyNotConfigured(_) | Self::RecoveryNotConfigured(_) => ErrorKind::NotFound,
            Self::EncryptionFailed(_)
            | Self::DecryptionFailed
            | Self::InvalidCiphertext(_)
            | Self::InvalidKeyLength { .. }
            | Self::InvalidAmount(_)
            | Self::KeyDerivationFailed(_) => ErrorKind::Crypto,
            Self::InvalidRecoveryKey(_) => ErrorKind::RecoveryKeyFormat,
            Self::Store(_) | Self::Database(_) => ErrorKind::Store,
            Self::Io(_) | Self::Serialization(_) | Self::CommandFailed(_) | Self::UserCancelled => {
                ErrorKind::Other
            }
        }
    }
}

/// Convenience type alias for BudgetVault results.
pub type Result<T> = std::result::Result<T, BudgetVaultError>;
