//! Integration tests for the SQLite store: key rows, five-table fetches,
//! and the all-or-nothing batch update.

use std::sync::Arc;

use tempfile::TempDir;

use budgetvault::crypto::{decrypt_amount, ClientSecret, Dek, MasterKey};
use budgetvault::manager::{KeyManager, ManagerOptions};
use budgetvault::store::{
    AmountTable, CipherState, CiphertextUpdate, EncryptedBatch, KeySaltStore, LedgerStore, RowOwner,
    SqliteStore,
};
use budgetvault::workflows::{backfill_user_data, change_client_secret};

fn seeded(store: &SqliteStore) {
    store.insert_budget("budget-1", "alice", Some(100.0)).unwrap();
    store.insert_template("template-1", "alice").unwrap();
    store.insert_amount_row(AmountTable::BudgetLine, "line-1", "budget-1", 50.0).unwrap();
    store.insert_amount_row(AmountTable::Transaction, "tx-1", "budget-1", 45.0).unwrap();
    store.insert_amount_row(AmountTable::TemplateLine, "tline-1", "template-1", 500.0).unwrap();
    store.insert_amount_row(AmountTable::SavingsGoal, "goal-1", "alice", 250.0).unwrap();

    store.insert_budget("budget-2", "bob", Some(7.0)).unwrap();
    store.insert_amount_row(AmountTable::Transaction, "tx-2", "budget-2", 3.0).unwrap();
}

#[tokio::test]
async fn key_rows_insert_once_and_update_in_place() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.find_user_key_row("alice").await.unwrap().is_none());

    store.insert_salt_if_absent("alice", &[1; 16], 3).await.unwrap();
    store.insert_salt_if_absent("alice", &[2; 16], 9).await.unwrap();
    let row = store.find_user_key_row("alice").await.unwrap().unwrap();
    assert_eq!(row.salt, vec![1; 16]);
    assert_eq!(row.kdf_iterations, 3);

    store.update_salt("alice", &[3; 16]).await.unwrap();
    store.update_wrapped_dek("alice", Some("wrapped")).await.unwrap();
    store.update_key_check("alice", "check").await.unwrap();
    let row = store.find_user_key_row("alice").await.unwrap().unwrap();
    assert_eq!(row.salt, vec![3; 16]);
    assert_eq!(row.wrapped_dek.as_deref(), Some("wrapped"));
    assert_eq!(row.key_check.as_deref(), Some("check"));

    store.update_wrapped_dek("alice", None).await.unwrap();
    assert!(store.find_user_key_row("alice").await.unwrap().unwrap().wrapped_dek.is_none());
}

#[tokio::test]
async fn updating_a_missing_key_row_is_a_store_error() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert!(store.update_salt("nobody", &[0; 16]).await.is_err());
}

#[tokio::test]
async fn fetch_selects_by_owner_and_cipher_state() {
    let store = SqliteStore::open_in_memory().unwrap();
    seeded(&store);

    let budgets = store.list_budget_ids("alice").await.unwrap();
    assert_eq!(budgets, vec!["budget-1".to_string()]);

    let rows = store
        .fetch_amount_rows(AmountTable::Transaction, RowOwner::Budgets(&budgets), CipherState::Missing)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "tx-1");
    assert_eq!(rows[0].amount, Some(45.0));

    let encrypted = store
        .fetch_amount_rows(AmountTable::Transaction, RowOwner::Budgets(&budgets), CipherState::Present)
        .await
        .unwrap();
    assert!(encrypted.is_empty());

    let none = store
        .fetch_amount_rows(AmountTable::BudgetLine, RowOwner::Budgets(&[]), CipherState::Missing)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn batch_with_a_foreign_row_rolls_back_entirely() {
    let store = SqliteStore::open_in_memory().unwrap();
    seeded(&store);

    let mut batch = EncryptedBatch::default();
    batch.monthly_budgets.push(CiphertextUpdate {
        id: "budget-1".into(),
        ciphertext: "ct-budget".into(),
    });
    // Belongs to bob: must not be writable through alice's batch.
    batch.transactions.push(CiphertextUpdate {
        id: "tx-2".into(),
        ciphertext: "ct-foreign".into(),
    });

    assert!(store.apply_encrypted_batch("alice", &batch).await.is_err());
    assert!(store.ciphertext_of(AmountTable::MonthlyBudget, "budget-1").unwrap().is_none());
    assert!(store.ciphertext_of(AmountTable::Transaction, "tx-2").unwrap().is_none());
}

#[tokio::test]
async fn count_rows_reports_progress_per_table() {
    let store = SqliteStore::open_in_memory().unwrap();
    seeded(&store);

    let before = store.count_rows("alice").await.unwrap();
    assert_eq!(before.len(), 5);
    assert!(before.iter().all(|s| s.encrypted == 0 && s.plaintext == 1));

    backfill_user_data("alice", &Dek::new([1; 32]), &store).await.unwrap();

    let after = store.count_rows("alice").await.unwrap();
    assert!(after.iter().all(|s| s.encrypted == 1 && s.plaintext == 0));
    let bob = store.count_rows("bob").await.unwrap();
    assert_eq!(bob.iter().map(|s| s.plaintext).sum::<usize>(), 2);
}

#[tokio::test]
async fn database_file_survives_reopen_and_rekey() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    let master = [0x42; 32];

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        seeded(&store);
        let manager = KeyManager::new(MasterKey::new(master), store.clone(), ManagerOptions::default());
        let dek = manager
            .derive_or_get_dek("alice", &ClientSecret::new([1; 32]))
            .await
            .unwrap();
        backfill_user_data("alice", &dek, store.as_ref()).await.unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let manager = KeyManager::new(MasterKey::new(master), store.clone(), ManagerOptions::default());
    change_client_secret(
        &manager,
        store.clone(),
        "alice",
        &ClientSecret::new([1; 32]),
        &ClientSecret::new([2; 32]),
    )
    .await
    .unwrap();

    let dek = manager
        .derive_or_get_dek("alice", &ClientSecret::new([2; 32]))
        .await
        .unwrap();
    let ciphertext = store
        .ciphertext_of(AmountTable::TemplateLine, "tline-1")
        .unwrap()
        .expect("template line encrypted");
    assert_eq!(decrypt_amount(&ciphertext, &dek).unwrap(), 500.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_users_on_a_multi_threaded_runtime() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    let tasks: Vec<_> = (0..8u8)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let user = format!("user-{i}");
                store.insert_salt_if_absent(&user, &[i; 16], 3).await.unwrap();
                store.update_key_check(&user, "check").await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for i in 0..8u8 {
        let row = store.find_user_key_row(&format!("user-{i}")).await.unwrap().unwrap();
        assert_eq!(row.salt, vec![i; 16]);
        assert_eq!(row.key_check.as_deref(), Some("check"));
    }
}

#[cfg(unix)]
#[test]
fn database_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.db");
    SqliteStore::open(&path).unwrap();
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
