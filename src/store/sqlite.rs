//! SQLite-backed store.
//!
//! Holds the `user_keys` table and the five amount tables.  The atomic
//! multi-table update runs inside a single transaction: if any row
//! update fails the transaction is dropped and nothing is written.
//!
//! `rusqlite` is synchronous, so every trait method runs its statements on
//! tokio's blocking pool against a shared connection.  The seeding helpers
//! stay synchronous and are meant for setup code outside a runtime.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::errors::{BudgetVaultError, Result};

use super::{
    AmountRow, AmountTable, CipherState, EncryptedBatch, KeySaltStore, LedgerStore, OwnerColumn,
    RowOwner, TableStatus, UserKeyRow,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_keys (
    user_id        TEXT PRIMARY KEY,
    salt           BLOB NOT NULL,
    kdf_iterations INTEGER NOT NULL,
    wrapped_dek    TEXT,
    key_check      TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS "monthly_budget" (
    id                       TEXT PRIMARY KEY,
    user_id                  TEXT NOT NULL,
    ending_balance           REAL,
    ending_balance_encrypted TEXT
);
CREATE TABLE IF NOT EXISTS "template" (
    id      TEXT PRIMARY KEY,
    user_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS "budget_line" (
    id               TEXT PRIMARY KEY,
    budget_id        TEXT NOT NULL REFERENCES "monthly_budget"(id),
    amount           REAL,
    amount_encrypted TEXT
);
CREATE TABLE IF NOT EXISTS "transaction" (
    id               TEXT PRIMARY KEY,
    budget_id        TEXT NOT NULL REFERENCES "monthly_budget"(id),
    amount           REAL,
    amount_encrypted TEXT
);
CREATE TABLE IF NOT EXISTS "template_line" (
    id               TEXT PRIMARY KEY,
    template_id      TEXT NOT NULL REFERENCES "template"(id),
    amount           REAL,
    amount_encrypted TEXT
);
CREATE TABLE IF NOT EXISTS "savings_goal" (
    id                      TEXT PRIMARY KEY,
    user_id                 TEXT NOT NULL,
    target_amount           REAL,
    target_amount_encrypted TEXT
);
"#;

fn owner_column_name(table: AmountTable) -> &'static str {
    match table.owner_column() {
        OwnerColumn::User => "user_id",
        OwnerColumn::Budget => "budget_id",
        OwnerColumn::Template => "template_id",
    }
}

/// SQL condition selecting the rows of `table` that belong to user `?1`.
fn owned_by_user_clause(table: AmountTable) -> &'static str {
    match table.owner_column() {
        OwnerColumn::User => "user_id = ?1",
        OwnerColumn::Budget => r#"budget_id IN (SELECT id FROM "monthly_budget" WHERE user_id = ?1)"#,
        OwnerColumn::Template => r#"template_id IN (SELECT id FROM "template" WHERE user_id = ?1)"#,
    }
}

/// SQLite implementation of `KeySaltStore` and `LedgerStore`.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::with_connection(Connection::open(path)?)?;

        // Owner-only permissions: the database holds salts and wrapped keys.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(store)
    }

    /// Fresh in-memory database (tests and dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| BudgetVaultError::Store(format!("database task failed: {e}")))?
    }

    // ------------------------------------------------------------------
    // Seeding helpers (CLI import and tests)
    // ------------------------------------------------------------------

    pub fn insert_budget(&self, id: &str, user_id: &str, ending_balance: Option<f64>) -> Result<()> {
        self.conn.lock().execute(
            r#"INSERT INTO "monthly_budget" (id, user_id, ending_balance) VALUES (?1, ?2, ?3)"#,
            params![id, user_id, ending_balance],
        )?;
        Ok(())
    }

    pub fn insert_template(&self, id: &str, user_id: &str) -> Result<()> {
        self.conn.lock().execute(
            r#"INSERT INTO "template" (id, user_id) VALUES (?1, ?2)"#,
            params![id, user_id],
        )?;
        Ok(())
    }

    /// Insert a plaintext row into one of the child tables.
    ///
    /// `owner_id` is a user, budget, or template id depending on the table.
    pub fn insert_amount_row(&self, table: AmountTable, id: &str, owner_id: &str, amount: f64) -> Result<()> {
        if table == AmountTable::MonthlyBudget {
            return self.insert_budget(id, owner_id, Some(amount));
        }
        let sql = format!(
            r#"INSERT INTO "{}" (id, {}, {}) VALUES (?1, ?2, ?3)"#,
            table.table_name(),
            owner_column_name(table),
            table.amount_column()
        );
        self.conn.lock().execute(&sql, params![id, owner_id, amount])?;
        Ok(())
    }

    /// Read a row's ciphertext column.
    pub fn ciphertext_of(&self, table: AmountTable, id: &str) -> Result<Option<String>> {
        let sql = format!(
            r#"SELECT {} FROM "{}" WHERE id = ?1"#,
            table.ciphertext_column(),
            table.table_name()
        );
        let value = self
            .conn
            .lock()
            .query_row(&sql, params![id], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(value.flatten())
    }
}

fn list_ids(conn: &Connection, sql: &str, user_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params![user_id], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn touch_key_row(conn: &Connection, sql: &str, user_id: &str, value: &dyn rusqlite::ToSql) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let changed = conn.execute(sql, params![value, now, user_id])?;
    if changed == 0 {
        return Err(BudgetVaultError::Store(format!(
            "no key row for user {user_id}"
        )));
    }
    Ok(())
}

#[async_trait]
impl KeySaltStore for SqliteStore {
    async fn find_user_key_row(&self, user_id: &str) -> Result<Option<UserKeyRow>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT salt, kdf_iterations, wrapped_dek, key_check FROM user_keys WHERE user_id = ?1",
                    params![user_id],
                    |row| {
                        Ok(UserKeyRow {
                            salt: row.get(0)?,
                            kdf_iterations: row.get(1)?,
                            wrapped_dek: row.get(2)?,
                            key_check: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn insert_salt_if_absent(&self, user_id: &str, salt: &[u8], kdf_iterations: u32) -> Result<()> {
        let user_id = user_id.to_string();
        let salt = salt.to_vec();
        self.blocking(move |conn| {
            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO user_keys (user_id, salt, kdf_iterations, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)
                 ON CONFLICT(user_id) DO NOTHING",
                params![user_id, salt, kdf_iterations, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_salt(&self, user_id: &str, salt: &[u8]) -> Result<()> {
        let user_id = user_id.to_string();
        let salt = salt.to_vec();
        self.blocking(move |conn| {
            touch_key_row(
                conn,
                "UPDATE user_keys SET salt = ?1, updated_at = ?2 WHERE user_id = ?3",
                &user_id,
                &salt,
            )
        })
        .await
    }

    async fn update_wrapped_dek(&self, user_id: &str, wrapped_dek: Option<&str>) -> Result<()> {
        let user_id = user_id.to_string();
        let wrapped_dek = wrapped_dek.map(str::to_string);
        self.blocking(move |conn| {
            touch_key_row(
                conn,
                "UPDATE user_keys SET wrapped_dek = ?1, updated_at = ?2 WHERE user_id = ?3",
                &user_id,
                &wrapped_dek,
            )
        })
        .await
    }

    async fn update_key_check(&self, user_id: &str, key_check: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let key_check = key_check.to_string();
        self.blocking(move |conn| {
            touch_key_row(
                conn,
                "UPDATE user_keys SET key_check = ?1, updated_at = ?2 WHERE user_id = ?3",
                &user_id,
                &key_check,
            )
        })
        .await
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn list_budget_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            list_ids(conn, r#"SELECT id FROM "monthly_budget" WHERE user_id = ?1 ORDER BY id"#, &user_id)
        })
        .await
    }

    async fn list_template_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            list_ids(conn, r#"SELECT id FROM "template" WHERE user_id = ?1 ORDER BY id"#, &user_id)
        })
        .await
    }

    async fn fetch_amount_rows(
        &self,
        table: AmountTable,
        owner: RowOwner<'_>,
        state: CipherState,
    ) -> Result<Vec<AmountRow>> {
        let (column, owner_ids): (&str, Vec<String>) = match owner {
            RowOwner::User(user_id) => ("user_id", vec![user_id.to_string()]),
            RowOwner::Budgets(ids) => ("budget_id", ids.to_vec()),
            RowOwner::Templates(ids) => ("template_id", ids.to_vec()),
        };
        if owner_ids.is_empty() {
            return Ok(Vec::new());
        }
        if column != owner_column_name(table) {
            return Err(BudgetVaultError::Store(format!(
                "{} rows are not owned through {column}",
                table.table_name()
            )));
        }

        let placeholders = vec!["?"; owner_ids.len()].join(", ");
        let null_test = match state {
            CipherState::Missing => "IS NULL",
            CipherState::Present => "IS NOT NULL",
        };
        let sql = format!(
            r#"SELECT id, {amount}, {cipher} FROM "{table}"
               WHERE {column} IN ({placeholders}) AND {cipher} {null_test}
               ORDER BY id"#,
            amount = table.amount_column(),
            cipher = table.ciphertext_column(),
            table = table.table_name(),
        );

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(owner_ids.iter()), |row| {
                    Ok(AmountRow {
                        id: row.get(0)?,
                        amount: row.get(1)?,
                        ciphertext: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn apply_encrypted_batch(&self, user_id: &str, batch: &EncryptedBatch) -> Result<()> {
        let user_id = user_id.to_string();
        let batch = batch.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;

            for table in AmountTable::ALL {
                let updates = batch.list(table);
                if updates.is_empty() {
                    continue;
                }
                let sql = format!(
                    r#"UPDATE "{}" SET {} = ?1 WHERE id = ?2 AND {}"#,
                    table.table_name(),
                    table.ciphertext_column(),
                    owned_by_user_clause(table).replace("?1", "?3"),
                );
                let mut stmt = tx.prepare(&sql)?;
                for update in updates {
                    let changed = stmt.execute(params![update.ciphertext, update.id, user_id])?;
                    if changed != 1 {
                        // Dropping `tx` without commit rolls everything back.
                        return Err(BudgetVaultError::Store(format!(
                            "{} row {} not found for user {user_id}",
                            table.table_name(),
                            update.id
                        )));
                    }
                }
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn count_rows(&self, user_id: &str) -> Result<Vec<TableStatus>> {
        let user_id = user_id.to_string();
        self.blocking(move |conn| {
            let mut statuses = Vec::with_capacity(AmountTable::ALL.len());
            for table in AmountTable::ALL {
                let sql = format!(
                    r#"SELECT COUNT({cipher}), COUNT(*) - COUNT({cipher}) FROM "{table}" WHERE {owned}"#,
                    cipher = table.ciphertext_column(),
                    table = table.table_name(),
                    owned = owned_by_user_clause(table),
                );
                let (encrypted, plaintext): (i64, i64) =
                    conn.query_row(&sql, params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
                statuses.push(TableStatus {
                    table,
                    encrypted: usize::try_from(encrypted).unwrap_or(0),
                    plaintext: usize::try_from(plaintext).unwrap_or(0),
                });
            }
            Ok(statuses)
        })
        .await
    }
}
