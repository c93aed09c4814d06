//! Persistence seams.
//!
//! Two traits describe everything the key manager and the workflows
//! need from the database:
//! - `KeySaltStore`: the per-user key row (salt, work factor, wrapped
//!   DEK, key check).
//! - `LedgerStore`: the five tables holding amounts, with per-table
//!   fetches and one atomic multi-table update.
//!
//! `MemoryStore` and `SqliteStore` implement both.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Key rows
// ---------------------------------------------------------------------------

/// Per-user key row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserKeyRow {
    pub salt: Vec<u8>,
    pub kdf_iterations: u32,
    /// DEK wrapped under the user's recovery key, if recovery is set up.
    pub wrapped_dek: Option<String>,
    /// Encryption of the amount `0` under the current DEK.
    pub key_check: Option<String>,
}

#[async_trait]
pub trait KeySaltStore: Send + Sync {
    async fn find_user_key_row(&self, user_id: &str) -> Result<Option<UserKeyRow>>;

    /// Insert a salt unless the user already has one.  Losing a race is
    /// not an error; callers re-read to get the winning value.
    async fn insert_salt_if_absent(&self, user_id: &str, salt: &[u8], kdf_iterations: u32) -> Result<()>;

    async fn update_salt(&self, user_id: &str, salt: &[u8]) -> Result<()>;

    async fn update_wrapped_dek(&self, user_id: &str, wrapped_dek: Option<&str>) -> Result<()>;

    async fn update_key_check(&self, user_id: &str, key_check: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Ledger tables
// ---------------------------------------------------------------------------

/// The five tables that hold encrypted amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountTable {
    MonthlyBudget,
    BudgetLine,
    Transaction,
    TemplateLine,
    SavingsGoal,
}

/// How rows of a table are tied to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerColumn {
    /// `user_id` column on the row itself.
    User,
    /// `budget_id` pointing at one of the user's monthly budgets.
    Budget,
    /// `template_id` pointing at one of the user's templates.
    Template,
}

impl AmountTable {
    pub const ALL: [AmountTable; 5] = [
        AmountTable::MonthlyBudget,
        AmountTable::BudgetLine,
        AmountTable::Transaction,
        AmountTable::TemplateLine,
        AmountTable::SavingsGoal,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::MonthlyBudget => "monthly_budget",
            Self::BudgetLine => "budget_line",
            Self::Transaction => "transaction",
            Self::TemplateLine => "template_line",
            Self::SavingsGoal => "savings_goal",
        }
    }

    /// Plaintext amount column.
    pub fn amount_column(self) -> &'static str {
        match self {
            Self::MonthlyBudget => "ending_balance",
            Self::SavingsGoal => "target_amount",
            Self::BudgetLine | Self::Transaction | Self::TemplateLine => "amount",
        }
    }

    /// Ciphertext column.
    pub fn ciphertext_column(self) -> &'static str {
        match self {
            Self::MonthlyBudget => "ending_balance_encrypted",
            Self::SavingsGoal => "target_amount_encrypted",
            Self::BudgetLine | Self::Transaction | Self::TemplateLine => "amount_encrypted",
        }
    }

    pub fn owner_column(self) -> OwnerColumn {
        match self {
            Self::MonthlyBudget | Self::SavingsGoal => OwnerColumn::User,
            Self::BudgetLine | Self::Transaction => OwnerColumn::Budget,
            Self::TemplateLine => OwnerColumn::Template,
        }
    }

    /// Name of this table's list in an atomic update payload.
    pub fn payload_key(self) -> &'static str {
        match self {
            Self::MonthlyBudget => "monthly_budgets",
            Self::BudgetLine => "budget_lines",
            Self::Transaction => "transactions",
            Self::TemplateLine => "template_lines",
            Self::SavingsGoal => "savings_goals",
        }
    }
}

/// Which rows a fetch selects, by state of the ciphertext column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherState {
    /// Ciphertext column is null (legacy plaintext rows).
    Missing,
    /// Ciphertext column is set.
    Present,
}

/// Row ownership filter for a fetch.
#[derive(Debug, Clone, Copy)]
pub enum RowOwner<'a> {
    User(&'a str),
    Budgets(&'a [String]),
    Templates(&'a [String]),
}

/// One row of an amount table, as far as encryption is concerned.
#[derive(Debug, Clone, PartialEq)]
pub struct AmountRow {
    pub id: String,
    pub amount: Option<f64>,
    pub ciphertext: Option<String>,
}

/// One row update inside an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiphertextUpdate {
    pub id: String,
    pub ciphertext: String,
}

/// Five per-table update lists applied as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptedBatch {
    pub monthly_budgets: Vec<CiphertextUpdate>,
    pub budget_lines: Vec<CiphertextUpdate>,
    pub transactions: Vec<CiphertextUpdate>,
    pub template_lines: Vec<CiphertextUpdate>,
    pub savings_goals: Vec<CiphertextUpdate>,
}

impl EncryptedBatch {
    pub fn list(&self, table: AmountTable) -> &[CiphertextUpdate] {
        match table {
            AmountTable::MonthlyBudget => &self.monthly_budgets,
            AmountTable::BudgetLine => &self.budget_lines,
            AmountTable::Transaction => &self.transactions,
            AmountTable::TemplateLine => &self.template_lines,
            AmountTable::SavingsGoal => &self.savings_goals,
        }
    }

    pub fn list_mut(&mut self, table: AmountTable) -> &mut Vec<CiphertextUpdate> {
        match table {
            AmountTable::MonthlyBudget => &mut self.monthly_budgets,
            AmountTable::BudgetLine => &mut self.budget_lines,
            AmountTable::Transaction => &mut self.transactions,
            AmountTable::TemplateLine => &mut self.template_lines,
            AmountTable::SavingsGoal => &mut self.savings_goals,
        }
    }

    pub fn total_rows(&self) -> usize {
        AmountTable::ALL.iter().map(|t| self.list(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }

    /// The payload in the shape of the stored procedure's named lists:
    /// `{ "budget_lines": [{ "id": ..., "amount_encrypted": ... }], ... }`.
    pub fn to_payload(&self) -> serde_json::Value {
        let mut root = serde_json::Map::new();
        for table in AmountTable::ALL {
            let rows = self
                .list(table)
                .iter()
                .map(|u| {
                    let mut row = serde_json::Map::new();
                    row.insert("id".into(), serde_json::Value::String(u.id.clone()));
                    row.insert(
                        table.ciphertext_column().into(),
                        serde_json::Value::String(u.ciphertext.clone()),
                    );
                    serde_json::Value::Object(row)
                })
                .collect();
            root.insert(table.payload_key().into(), serde_json::Value::Array(rows));
        }
        serde_json::Value::Object(root)
    }
}

/// Encrypted vs plaintext row counts for one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableStatus {
    pub table: AmountTable,
    pub encrypted: usize,
    pub plaintext: usize,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Ids of the user's monthly budgets.
    async fn list_budget_ids(&self, user_id: &str) -> Result<Vec<String>>;

    /// Ids of the user's budget templates.
    async fn list_template_ids(&self, user_id: &str) -> Result<Vec<String>>;

    /// Rows of `table` owned by `owner` whose ciphertext is in `state`.
    async fn fetch_amount_rows(
        &self,
        table: AmountTable,
        owner: RowOwner<'_>,
        state: CipherState,
    ) -> Result<Vec<AmountRow>>;

    /// Apply all five update lists in one transaction.  Either every row
    /// is written or none is.
    async fn apply_encrypted_batch(&self, user_id: &str, batch: &EncryptedBatch) -> Result<()>;

    /// Per-table encrypted/plaintext counts for a user.
    async fn count_rows(&self, user_id: &str) -> Result<Vec<TableStatus>>;
}
