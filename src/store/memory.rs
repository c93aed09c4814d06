//! In-memory store implementing both store traits.
//!
//! Used by tests and demos.  Keeps call counters and supports failure
//! injection so callers can observe exactly which store operations ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::errors::{BudgetVaultError, Result};

use super::{
    AmountRow, AmountTable, CipherState, EncryptedBatch, KeySaltStore, LedgerStore, OwnerColumn,
    RowOwner, TableStatus, UserKeyRow,
};

#[derive(Debug, Clone)]
struct StoredRow {
    id: String,
    owner_id: String,
    amount: Option<f64>,
    ciphertext: Option<String>,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, UserKeyRow>,
    /// (budget id, user id)
    budgets: Vec<(String, String)>,
    /// (template id, user id)
    templates: Vec<(String, String)>,
    rows: HashMap<AmountTable, Vec<StoredRow>>,
    applied: Vec<EncryptedBatch>,
    fail_apply: Option<String>,
    fail_fetch: Option<AmountTable>,
}

/// Thread-safe in-memory implementation of `KeySaltStore` and `LedgerStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    key_row_reads: AtomicUsize,
    apply_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Seeding
    // ------------------------------------------------------------------

    pub fn add_budget(&self, budget_id: &str, user_id: &str) {
        self.state
            .lock()
            .budgets
            .push((budget_id.to_string(), user_id.to_string()));
    }

    pub fn add_template(&self, template_id: &str, user_id: &str) {
        self.state
            .lock()
            .templates
            .push((template_id.to_string(), user_id.to_string()));
    }

    /// Add a row to `table`.  `owner_id` is the user, budget, or template
    /// id depending on the table's owner column.
    pub fn add_row(
        &self,
        table: AmountTable,
        id: &str,
        owner_id: &str,
        amount: Option<f64>,
        ciphertext: Option<&str>,
    ) {
        self.state.lock().rows.entry(table).or_default().push(StoredRow {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            amount,
            ciphertext: ciphertext.map(str::to_string),
        });
    }

    pub fn set_key_row(&self, user_id: &str, row: UserKeyRow) {
        self.state.lock().keys.insert(user_id.to_string(), row);
    }

    // ------------------------------------------------------------------
    // Failure injection
    // ------------------------------------------------------------------

    /// Make every `apply_encrypted_batch` call fail with `message`.
    pub fn fail_apply_with(&self, message: &str) {
        self.state.lock().fail_apply = Some(message.to_string());
    }

    /// Make fetches from `table` fail.
    pub fn fail_fetch_from(&self, table: AmountTable) {
        self.state.lock().fail_fetch = Some(table);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn key_row(&self, user_id: &str) -> Option<UserKeyRow> {
        self.state.lock().keys.get(user_id).cloned()
    }

    pub fn ciphertext_of(&self, table: AmountTable, id: &str) -> Option<String> {
        self.state
            .lock()
            .rows
            .get(&table)
            .and_then(|rows| rows.iter().find(|r| r.id == id))
            .and_then(|r| r.ciphertext.clone())
    }

    /// Number of `find_user_key_row` calls so far.
    pub fn key_row_reads(&self) -> usize {
        self.key_row_reads.load(Ordering::SeqCst)
    }

    /// Number of `apply_encrypted_batch` calls so far, failed ones included.
    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Batches that were successfully applied, oldest first.
    pub fn applied_batches(&self) -> Vec<EncryptedBatch> {
        self.state.lock().applied.clone()
    }

    fn owned_ids(pairs: &[(String, String)], user_id: &str) -> Vec<String> {
        pairs
            .iter()
            .filter(|(_, owner)| owner == user_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl KeySaltStore for MemoryStore {
    async fn find_user_key_row(&self, user_id: &str) -> Result<Option<UserKeyRow>> {
        self.key_row_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().keys.get(user_id).cloned())
    }

    async fn insert_salt_if_absent(&self, user_id: &str, salt: &[u8], kdf_iterations: u32) -> Result<()> {
        self.state
            .lock()
            .keys
            .entry(user_id.to_string())
            .or_insert_with(|| UserKeyRow {
                salt: salt.to_vec(),
                kdf_iterations,
                wrapped_dek: None,
                key_check: None,
            });
        Ok(())
    }

    async fn update_salt(&self, user_id: &str, salt: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .keys
            .get_mut(user_id)
            .ok_or_else(|| BudgetVaultError::Store(format!("no key row for user {user_id}")))?;
        row.salt = salt.to_vec();
        Ok(())
    }

    async fn update_wrapped_dek(&self, user_id: &str, wrapped_dek: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .keys
            .get_mut(user_id)
            .ok_or_else(|| BudgetVaultError::Store(format!("no key row for user {user_id}")))?;
        row.wrapped_dek = wrapped_dek.map(str::to_string);
        Ok(())
    }

    async fn update_key_check(&self, user_id: &str, key_check: &str) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .keys
            .get_mut(user_id)
            .ok_or_else(|| BudgetVaultError::Store(format!("no key row for user {user_id}")))?;
        row.key_check = Some(key_check.to_string());
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn list_budget_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(Self::owned_ids(&self.state.lock().budgets, user_id))
    }

    async fn list_template_ids(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(Self::owned_ids(&self.state.lock().templates, user_id))
    }

    async fn fetch_amount_rows(
        &self,
        table: AmountTable,
        owner: RowOwner<'_>,
        state: CipherState,
    ) -> Result<Vec<AmountRow>> {
        let guard = self.state.lock();
        if guard.fail_fetch == Some(table) {
            return Err(BudgetVaultError::Store(format!(
                "fetch from {} failed",
                table.table_name()
            )));
        }

        let owns = |row: &StoredRow| match owner {
            RowOwner::User(user_id) => row.owner_id == user_id,
            RowOwner::Budgets(ids) | RowOwner::Templates(ids) => ids.contains(&row.owner_id),
        };
        let matches_state = |row: &StoredRow| match state {
            CipherState::Missing => row.ciphertext.is_none(),
            CipherState::Present => row.ciphertext.is_some(),
        };

        Ok(guard
            .rows
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| owns(r) && matches_state(r))
                    .map(|r| AmountRow {
                        id: r.id.clone(),
                        amount: r.amount,
                        ciphertext: r.ciphertext.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn apply_encrypted_batch(&self, _user_id: &str, batch: &EncryptedBatch) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();

        if let Some(message) = &state.fail_apply {
            return Err(BudgetVaultError::Store(message.clone()));
        }

        // Validate every target first so a bad id leaves nothing applied.
        for table in AmountTable::ALL {
            let rows = state.rows.get(&table);
            for update in batch.list(table) {
                let exists = rows.is_some_and(|rows| rows.iter().any(|r| r.id == update.id));
                if !exists {
                    return Err(BudgetVaultError::Store(format!(
                        "{} row {} does not exist",
                        table.table_name(),
                        update.id
                    )));
                }
            }
        }

        for table in AmountTable::ALL {
            if let Some(rows) = state.rows.get_mut(&table) {
                for update in batch.list(table) {
                    if let Some(row) = rows.iter_mut().find(|r| r.id == update.id) {
                        row.ciphertext = Some(update.ciphertext.clone());
                    }
                }
            }
        }

        state.applied.push(batch.clone());
        Ok(())
    }

    async fn count_rows(&self, user_id: &str) -> Result<Vec<TableStatus>> {
        let state = self.state.lock();
        let budgets = Self::owned_ids(&state.budgets, user_id);
        let templates = Self::owned_ids(&state.templates, user_id);

        Ok(AmountTable::ALL
            .iter()
            .map(|table| {
                let owned: Vec<&StoredRow> = state
                    .rows
                    .get(table)
                    .map(|rows| {
                        rows.iter()
                            .filter(|r| match table.owner_column() {
                                OwnerColumn::User => r.owner_id == user_id,
                                OwnerColumn::Budget => budgets.contains(&r.owner_id),
                                OwnerColumn::Template => templates.contains(&r.owner_id),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let encrypted = owned.iter().filter(|r| r.ciphertext.is_some()).count();
                TableStatus {
                    table: *table,
                    encrypted,
                    plaintext: owned.len() - encrypted,
                }
            })
            .collect())
    }
}
