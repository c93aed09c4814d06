//! Integration tests for the key manager: DEK caching, key checks,
//! recovery keys, and credential-change orchestration.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use budgetvault::crypto::{derive_dek, ClientSecret, MasterKey};
use budgetvault::errors::{BudgetVaultError, ErrorKind};
use budgetvault::manager::{KeyManager, ManagerOptions};
use budgetvault::store::MemoryStore;

fn secret(byte: u8) -> ClientSecret {
    ClientSecret::new([byte; 32])
}

fn master() -> MasterKey {
    MasterKey::new([0x42; 32])
}

fn setup_with(options: ManagerOptions) -> (Arc<KeyManager>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(KeyManager::new(master(), store.clone(), options));
    (manager, store)
}

fn setup() -> (Arc<KeyManager>, Arc<MemoryStore>) {
    setup_with(ManagerOptions::default())
}

// ---------------------------------------------------------------------------
// DEK derivation and caching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn first_derivation_creates_salt_and_later_calls_hit_cache() {
    let (manager, store) = setup();

    let first = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    let row = store.key_row("u1").expect("salt should be created");
    assert_eq!(row.salt.len(), 16);
    assert_eq!(row.kdf_iterations, 3);

    let reads = store.key_row_reads();
    let second = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    assert_eq!(first.as_bytes(), second.as_bytes());
    assert_eq!(store.key_row_reads(), reads, "cache hit must not touch the store");

    let expected = derive_dek(&secret(1), &master(), &row.salt, "u1").unwrap();
    assert_eq!(first.as_bytes(), expected.as_bytes());
}

#[tokio::test]
async fn cache_entries_are_per_client_secret() {
    let (manager, _store) = setup();
    let a = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    let b = manager.derive_or_get_dek("u1", &secret(2)).await.unwrap();
    assert_ne!(a.as_bytes(), b.as_bytes());
    assert_eq!(manager.cached_dek_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_rederived() {
    let (manager, store) = setup();
    manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    let reads = store.key_row_reads();

    tokio::time::advance(Duration::from_secs(299)).await;
    manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    assert_eq!(store.key_row_reads(), reads);

    tokio::time::advance(Duration::from_secs(2)).await;
    manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    assert!(store.key_row_reads() > reads);
}

#[tokio::test]
async fn invalidation_forces_rederivation() {
    let (manager, store) = setup();
    manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    manager.derive_or_get_dek("u2", &secret(1)).await.unwrap();

    manager.invalidate_user("u1");
    assert_eq!(manager.cached_dek_count(), 1);

    let reads = store.key_row_reads();
    manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    assert_eq!(store.key_row_reads(), reads + 1);
}

#[tokio::test]
async fn concurrent_first_use_agrees_on_one_salt() {
    let (manager, store) = setup();
    let (s1, s2) = (secret(1), secret(1));
    let (a, b) = tokio::join!(
        manager.derive_or_get_dek("u1", &s1),
        manager.derive_or_get_dek("u1", &s2),
    );
    assert_eq!(a.unwrap().as_bytes(), b.unwrap().as_bytes());
    assert!(store.key_row("u1").is_some());
}

#[tokio::test]
async fn get_dek_requires_an_existing_salt() {
    let (manager, store) = setup();
    let err = manager.get_dek("u1", &secret(1)).await.unwrap_err();
    assert!(matches!(err, BudgetVaultError::KeyNotConfigured(ref u) if u == "u1"));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(store.key_row("u1").is_none(), "get_dek must not create a salt");

    let created = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    manager.invalidate_user("u1");
    let fetched = manager.get_dek("u1", &secret(1)).await.unwrap();
    assert_eq!(created.as_bytes(), fetched.as_bytes());
}

#[tokio::test]
async fn demo_accounts_never_touch_the_store() {
    let (manager, store) = setup_with(ManagerOptions {
        demo_users: vec!["demo".into()],
        ..ManagerOptions::default()
    });

    let a = manager.get_dek("demo", &secret(1)).await.unwrap();
    let b = manager.get_dek("demo", &secret(1)).await.unwrap();
    assert_eq!(a.as_bytes(), b.as_bytes());
    assert_eq!(store.key_row_reads(), 0);
    assert!(store.key_row("demo").is_none());
}

#[tokio::test]
async fn demo_accounts_get_the_same_dek_from_both_entry_points() {
    let (manager, store) = setup_with(ManagerOptions {
        demo_users: vec!["demo".into()],
        ..ManagerOptions::default()
    });

    let created = manager.derive_or_get_dek("demo", &secret(1)).await.unwrap();
    let fetched = manager.get_dek("demo", &secret(1)).await.unwrap();
    assert_eq!(created.as_bytes(), fetched.as_bytes());

    assert!(manager.verify_and_ensure_key_check("demo", &secret(1)).await.unwrap());
    assert_eq!(store.key_row_reads(), 0);
    assert!(store.key_row("demo").is_none());
    assert_eq!(manager.cached_dek_count(), 0);
}

// ---------------------------------------------------------------------------
// Key check
// ---------------------------------------------------------------------------

#[tokio::test]
async fn key_check_is_created_once_then_verified() {
    let (manager, store) = setup();

    assert!(manager.verify_and_ensure_key_check("u1", &secret(1)).await.unwrap());
    let check = store.key_row("u1").unwrap().key_check.expect("key check stored");

    assert!(manager.verify_and_ensure_key_check("u1", &secret(1)).await.unwrap());
    assert!(!manager.verify_and_ensure_key_check("u1", &secret(2)).await.unwrap());
    assert_eq!(store.key_row("u1").unwrap().key_check.unwrap(), check);
}

// ---------------------------------------------------------------------------
// Recovery keys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn setup_recovery_persists_only_the_wrapped_dek() {
    let (manager, store) = setup();
    let formatted = manager.setup_recovery_key("u1", &secret(1)).await.unwrap();

    let wrapped = store.key_row("u1").unwrap().wrapped_dek.expect("wrapped DEK stored");
    assert!(!wrapped.contains(formatted.as_str()));
    assert_eq!(formatted.split('-').count(), 13);
}

#[tokio::test]
async fn setup_recovery_rejects_a_wrong_secret() {
    let (manager, store) = setup();
    manager.verify_and_ensure_key_check("u1", &secret(1)).await.unwrap();

    let err = manager.setup_recovery_key("u1", &secret(9)).await.unwrap_err();
    assert!(matches!(err, BudgetVaultError::DecryptionFailed));
    assert!(store.key_row("u1").unwrap().wrapped_dek.is_none());
}

#[tokio::test]
async fn recover_without_recovery_key_is_not_found() {
    let (manager, _store) = setup();
    manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();

    let err = manager
        .recover_with_key("u1", "AAAA-BBBB", &secret(2), |_, _| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetVaultError::RecoveryNotConfigured(_)));
}

#[tokio::test]
async fn recover_with_garbled_key_is_a_format_error() {
    let (manager, _store) = setup();
    manager.setup_recovery_key("u1", &secret(1)).await.unwrap();

    let called = AtomicBool::new(false);
    let called_ref = &called;
    let err = manager
        .recover_with_key("u1", "0000-1111", &secret(2), move |_, _| async move {
            called_ref.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecoveryKeyFormat);
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn recover_with_someone_elses_key_fails_authentication() {
    let (manager, _store) = setup();
    manager.setup_recovery_key("u1", &secret(1)).await.unwrap();
    let other = manager.setup_recovery_key("u2", &secret(1)).await.unwrap();

    let err = manager
        .recover_with_key("u1", &other, &secret(2), |_, _| async { Ok(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetVaultError::DecryptionFailed));
}

#[tokio::test]
async fn recover_hands_old_and_new_dek_to_callback_and_rewraps() {
    let (manager, store) = setup();
    let old_dek = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    let formatted = manager.setup_recovery_key("u1", &secret(1)).await.unwrap();
    let salt = store.key_row("u1").unwrap().salt;

    let seen = parking_lot::Mutex::new(None);
    let seen_ref = &seen;
    manager
        .recover_with_key("u1", &formatted, &secret(2), move |old, new| async move {
            *seen_ref.lock() = Some((old, new));
            Ok(())
        })
        .await
        .unwrap();

    let (old, new) = seen.into_inner().expect("callback ran");
    assert_eq!(old.as_bytes(), old_dek.as_bytes());
    let expected_new = derive_dek(&secret(2), &master(), &salt, "u1").unwrap();
    assert_eq!(new.as_bytes(), expected_new.as_bytes());

    // Same salt, new key check, and the same recovery key still works.
    let row = store.key_row("u1").unwrap();
    assert_eq!(row.salt, salt);
    assert!(manager.verify_and_ensure_key_check("u1", &secret(2)).await.unwrap());
    manager
        .recover_with_key("u1", &formatted, &secret(3), |_, _| async { Ok(()) })
        .await
        .unwrap();
}

// ---------------------------------------------------------------------------
// Credential change
// ---------------------------------------------------------------------------

#[tokio::test]
async fn password_change_rotates_salt_and_clears_recovery() {
    let (manager, store) = setup();
    manager.setup_recovery_key("u1", &secret(1)).await.unwrap();
    let before = store.key_row("u1").unwrap();

    manager
        .on_password_change("u1", &secret(1), &secret(2), |_, _| async { Ok(()) })
        .await
        .unwrap();

    let after = store.key_row("u1").unwrap();
    assert_ne!(after.salt, before.salt);
    assert!(after.wrapped_dek.is_none());
    assert!(manager.verify_and_ensure_key_check("u1", &secret(2)).await.unwrap());
    assert!(!manager.verify_and_ensure_key_check("u1", &secret(1)).await.unwrap());
}

#[tokio::test]
async fn failed_reencryption_restores_the_previous_salt() {
    let (manager, store) = setup();
    let old_dek = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    let before = store.key_row("u1").unwrap();

    let err = manager
        .on_password_change("u1", &secret(1), &secret(2), |_, _| async {
            Err(BudgetVaultError::Store("rpc failed".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BudgetVaultError::Store(ref m) if m == "rpc failed"));

    assert_eq!(store.key_row("u1").unwrap().salt, before.salt);
    assert_eq!(manager.cached_dek_count(), 0);
    let again = manager.derive_or_get_dek("u1", &secret(1)).await.unwrap();
    assert_eq!(again.as_bytes(), old_dek.as_bytes());
}

#[tokio::test]
async fn password_change_with_wrong_old_secret_changes_nothing() {
    let (manager, store) = setup();
    manager.verify_and_ensure_key_check("u1", &secret(1)).await.unwrap();
    let before = store.key_row("u1").unwrap();

    let calls = AtomicUsize::new(0);
    let calls_ref = &calls;
    let err = manager
        .on_password_change("u1", &secret(7), &secret(2), move |_, _| async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, BudgetVaultError::DecryptionFailed));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.key_row("u1").unwrap(), before);
}

#[tokio::test]
async fn credential_changes_for_one_user_run_one_at_a_time() {
    let (manager, _store) = setup();
    manager.verify_and_ensure_key_check("u1", &secret(1)).await.unwrap();

    let (started_tx, started_rx) = oneshot::channel::<()>();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let second_ran = Arc::new(AtomicBool::new(false));

    let m1 = Arc::clone(&manager);
    let first = tokio::spawn(async move {
        m1.on_password_change("u1", &secret(1), &secret(2), move |_, _| async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok(())
        })
        .await
    });
    started_rx.await.unwrap();

    let m2 = Arc::clone(&manager);
    let flag = Arc::clone(&second_ran);
    let second = tokio::spawn(async move {
        m2.on_password_change("u1", &secret(2), &secret(3), move |_, _| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
    });

    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    assert!(!second_ran.load(Ordering::SeqCst), "second change ran while first held the lock");

    release_tx.send(()).unwrap();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(second_ran.load(Ordering::SeqCst));
    assert!(manager.verify_and_ensure_key_check("u1", &secret(3)).await.unwrap());
}

#[tokio::test]
async fn from_settings_fails_fast_without_master_key() {
    let settings: budgetvault::config::Settings = toml::from_str("").unwrap();
    let store = Arc::new(MemoryStore::new());
    let err = match KeyManager::from_settings(&settings, store) {
        Ok(_) => panic!("manager built without a master key"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
