//! First-time encryption of legacy plaintext rows.

use tracing::{debug, info, warn};

use crate::crypto::amount::encrypt_amount;
use crate::crypto::keys::Dek;
use crate::errors::Result;
use crate::store::{CipherState, CiphertextUpdate, EncryptedBatch, LedgerStore};

use super::fetch_user_rows;

/// Build the batch that would encrypt all of the user's plaintext rows.
///
/// Returns `None` when no row lacks a ciphertext.  Nothing is written.
pub async fn build_backfill_batch(
    user_id: &str,
    dek: &Dek,
    store: &dyn LedgerStore,
) -> Result<Option<EncryptedBatch>> {
    let rows = fetch_user_rows(store, user_id, CipherState::Missing).await?;

    let mut batch = EncryptedBatch::default();
    for (table, rows) in rows {
        let list = batch.list_mut(table);
        list.reserve(rows.len());
        for row in rows {
            // Nothing to protect on a row that never had an amount.
            let Some(amount) = row.amount else {
                warn!(user_id, table = table.table_name(), row_id = %row.id, "row has no amount, skipping");
                continue;
            };
            list.push(CiphertextUpdate {
                ciphertext: encrypt_amount(amount, dek)?,
                id: row.id,
            });
        }
    }

    if batch.is_empty() {
        return Ok(None);
    }
    Ok(Some(batch))
}

/// Encrypt every legacy plaintext row of the user under `dek`.
///
/// A user with nothing to backfill causes no write at all.  Otherwise
/// all five tables are updated in one atomic store call; any fetch or
/// store error is returned unchanged.
pub async fn backfill_user_data(user_id: &str, dek: &Dek, store: &dyn LedgerStore) -> Result<()> {
    let Some(batch) = build_backfill_batch(user_id, dek, store).await? else {
        debug!(user_id, "nothing to backfill");
        return Ok(());
    };

    store.apply_encrypted_batch(user_id, &batch).await?;
    info!(user_id, rows = batch.total_rows(), "backfilled plaintext amounts");
    Ok(())
}
