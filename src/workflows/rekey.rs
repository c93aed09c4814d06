//! Re-encryption of a user's data from one DEK to another.

use tracing::{info, warn};

use crate::crypto::amount::{decrypt_amount, encrypt_amount};
use crate::crypto::keys::Dek;
use crate::errors::Result;
use crate::store::{CipherState, CiphertextUpdate, EncryptedBatch, LedgerStore};

use super::fetch_user_rows;

/// Build the batch moving every encrypted row from `old_dek` to `new_dek`.
///
/// Decryption is strict: one row that does not open under `old_dek`
/// fails the whole build, so nothing is ever re-encrypted from a wrong
/// key.  Rows without a ciphertext (written during a migration window)
/// have their plaintext amount encrypted directly.
pub async fn build_rekey_batch(
    user_id: &str,
    old_dek: &Dek,
    new_dek: &Dek,
    store: &dyn LedgerStore,
) -> Result<EncryptedBatch> {
    let rows = fetch_user_rows(store, user_id, CipherState::Present).await?;

    let mut batch = EncryptedBatch::default();
    for (table, rows) in rows {
        let list = batch.list_mut(table);
        list.reserve(rows.len());
        for row in rows {
            let amount = match (&row.ciphertext, row.amount) {
                (Some(ciphertext), _) => decrypt_amount(ciphertext, old_dek)?,
                (None, Some(amount)) => amount,
                (None, None) => {
                    warn!(user_id, table = table.table_name(), row_id = %row.id, "row has no amount, skipping");
                    continue;
                }
            };
            list.push(CiphertextUpdate {
                ciphertext: encrypt_amount(amount, new_dek)?,
                id: row.id,
            });
        }
    }
    Ok(batch)
}

/// Re-encrypt all of the user's encrypted rows under `new_dek`.
///
/// The atomic store call always happens once the five lists are built,
/// even if all of them are empty.  Any decrypt, fetch, or store failure
/// is returned and nothing is written.
pub async fn reencrypt_all_user_data(
    user_id: &str,
    old_dek: &Dek,
    new_dek: &Dek,
    store: &dyn LedgerStore,
) -> Result<()> {
    let batch = build_rekey_batch(user_id, old_dek, new_dek, store).await?;
    store.apply_encrypted_batch(user_id, &batch).await?;
    info!(user_id, rows = batch.total_rows(), "re-encrypted amounts under new key");
    Ok(())
}
