//! Bulk data transformation across the five amount tables.
//!
//! - `backfill`: encrypt legacy plaintext rows for the first time.
//! - `rekey`: move already-encrypted rows from one DEK to another.
//!
//! Both fetch with internal parallelism and finish with exactly one
//! atomic `LedgerStore::apply_encrypted_batch` call (or none, for a
//! backfill with nothing to do).

pub mod backfill;
pub mod rekey;

use std::sync::Arc;

use crate::crypto::keys::ClientSecret;
use crate::errors::Result;
use crate::manager::KeyManager;
use crate::store::{AmountRow, AmountTable, CipherState, LedgerStore, RowOwner};

pub use backfill::{backfill_user_data, build_backfill_batch};
pub use rekey::{build_rekey_batch, reencrypt_all_user_data};

/// Rows of all five tables for one user, in `AmountTable::ALL` order.
pub(crate) type UserRows = Vec<(AmountTable, Vec<AmountRow>)>;

/// Fetch every row of the user's five tables whose ciphertext is in `state`.
///
/// Container ids (budgets, templates) are fetched in parallel first,
/// then the five tables in parallel.  Any fetch error aborts.
pub(crate) async fn fetch_user_rows(
    store: &dyn LedgerStore,
    user_id: &str,
    state: CipherState,
) -> Result<UserRows> {
    let (budget_ids, template_ids) = tokio::try_join!(
        store.list_budget_ids(user_id),
        store.list_template_ids(user_id),
    )?;

    let (monthly_budgets, budget_lines, transactions, template_lines, savings_goals) = tokio::try_join!(
        store.fetch_amount_rows(AmountTable::MonthlyBudget, RowOwner::User(user_id), state),
        store.fetch_amount_rows(AmountTable::BudgetLine, RowOwner::Budgets(&budget_ids), state),
        store.fetch_amount_rows(AmountTable::Transaction, RowOwner::Budgets(&budget_ids), state),
        store.fetch_amount_rows(AmountTable::TemplateLine, RowOwner::Templates(&template_ids), state),
        store.fetch_amount_rows(AmountTable::SavingsGoal, RowOwner::User(user_id), state),
    )?;

    Ok(vec![
        (AmountTable::MonthlyBudget, monthly_budgets),
        (AmountTable::BudgetLine, budget_lines),
        (AmountTable::Transaction, transactions),
        (AmountTable::TemplateLine, template_lines),
        (AmountTable::SavingsGoal, savings_goals),
    ])
}

/// Change a user's client secret and move all their data to the new DEK.
pub async fn change_client_secret(
    manager: &KeyManager,
    store: Arc<dyn LedgerStore>,
    user_id: &str,
    old_client_secret: &ClientSecret,
    new_client_secret: &ClientSecret,
) -> Result<()> {
    manager
        .on_password_change(user_id, old_client_secret, new_client_secret, |old_dek, new_dek| {
            let store = Arc::clone(&store);
            async move { reencrypt_all_user_data(user_id, &old_dek, &new_dek, store.as_ref()).await }
        })
        .await
}

/// Recover an account with its recovery key and re-key all its data.
pub async fn recover_account(
    manager: &KeyManager,
    store: Arc<dyn LedgerStore>,
    user_id: &str,
    formatted_recovery_key: &str,
    new_client_secret: &ClientSecret,
) -> Result<()> {
    manager
        .recover_with_key(user_id, formatted_recovery_key, new_client_secret, |old_dek, new_dek| {
            let store = Arc::clone(&store);
            async move { reencrypt_all_user_data(user_id, &old_dek, &new_dek, store.as_ref()).await }
        })
        .await
}
