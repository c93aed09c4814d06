//! Integration tests for the opportunistic backfill trigger.

use std::sync::Arc;
use std::time::Duration;

use budgetvault::config::Settings;
use budgetvault::crypto::{decrypt_amount, ClientSecret, MasterKey};
use budgetvault::manager::{KeyManager, ManagerOptions};
use budgetvault::store::{AmountTable, MemoryStore};
use budgetvault::trigger::{BackfillTrigger, RequestContext, DEFAULT_CAPACITY};

fn request(user_id: &str, skip_backfill: bool) -> RequestContext {
    RequestContext {
        user_id: user_id.to_string(),
        client_secret: ClientSecret::new([1; 32]),
        skip_backfill,
    }
}

fn setup(ttl: Duration, capacity: usize) -> (BackfillTrigger, Arc<KeyManager>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for user in ["alice", "bob", "carol"] {
        store.add_row(AmountTable::SavingsGoal, &format!("goal-{user}"), user, Some(10.0), None);
    }
    let manager = Arc::new(KeyManager::new(
        MasterKey::new([0x42; 32]),
        store.clone(),
        ManagerOptions::default(),
    ));
    let trigger = BackfillTrigger::with_limits(manager.clone(), store.clone(), ttl, capacity);
    (trigger, manager, store)
}

#[tokio::test]
async fn first_request_backfills_in_the_background() {
    let (trigger, manager, store) = setup(Duration::from_secs(60), 10);

    let handle = trigger.on_request(request("alice", false)).expect("backfill should start");
    handle.await.unwrap();

    let dek = manager
        .derive_or_get_dek("alice", &ClientSecret::new([1; 32]))
        .await
        .unwrap();
    let ciphertext = store.ciphertext_of(AmountTable::SavingsGoal, "goal-alice").unwrap();
    assert_eq!(decrypt_amount(&ciphertext, &dek).unwrap(), 10.0);
    assert!(store.ciphertext_of(AmountTable::SavingsGoal, "goal-bob").is_none());
}

#[tokio::test]
async fn repeat_requests_within_the_window_are_skipped() {
    let (trigger, _manager, store) = setup(Duration::from_secs(60), 10);

    trigger.on_request(request("alice", false)).unwrap().await.unwrap();
    assert!(trigger.on_request(request("alice", false)).is_none());
    assert!(trigger.on_request(request("alice", false)).is_none());
    assert_eq!(store.apply_calls(), 1);
}

#[tokio::test]
async fn opt_out_skips_without_marking_the_user() {
    let (trigger, _manager, store) = setup(Duration::from_secs(60), 10);

    assert!(trigger.on_request(request("alice", true)).is_none());
    assert!(!trigger.is_tracked("alice"));
    assert_eq!(store.apply_calls(), 0);

    assert!(trigger.on_request(request("alice", false)).is_some());
}

#[tokio::test(start_paused = true)]
async fn users_become_eligible_again_after_expiry() {
    let (trigger, _manager, _store) = setup(Duration::from_secs(60), 10);

    trigger.on_request(request("alice", false)).unwrap().await.unwrap();
    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(trigger.on_request(request("alice", false)).is_none());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(!trigger.is_tracked("alice"));
    assert!(trigger.on_request(request("alice", false)).is_some());
}

#[tokio::test]
async fn failed_backfill_evicts_the_user_for_retry() {
    let (trigger, _manager, store) = setup(Duration::from_secs(60), 10);
    store.fail_apply_with("database unavailable");

    let handle = trigger.on_request(request("alice", false)).unwrap();
    handle.await.expect("failure must stay inside the task");

    assert!(!trigger.is_tracked("alice"));
    assert!(trigger.on_request(request("alice", false)).is_some());
}

#[tokio::test]
async fn tracking_is_capped_by_evicting_the_oldest_user() {
    let (trigger, _manager, _store) = setup(Duration::from_secs(60), 2);

    for user in ["alice", "bob", "carol"] {
        trigger.on_request(request(user, false)).unwrap().await.unwrap();
    }

    assert_eq!(trigger.tracked_count(), 2);
    assert!(!trigger.is_tracked("alice"));
    assert!(trigger.is_tracked("bob"));
    assert!(trigger.is_tracked("carol"));
}

#[tokio::test]
async fn users_are_marked_before_the_backfill_finishes() {
    let (trigger, _manager, store) = setup(Duration::from_secs(60), 10);

    let first = trigger.on_request(request("alice", false)).unwrap();
    // The task has not run yet on this single-threaded runtime.
    assert!(trigger.is_tracked("alice"));
    assert!(trigger.on_request(request("alice", false)).is_none());

    first.await.unwrap();
    assert_eq!(store.apply_calls(), 1);
}

#[tokio::test]
async fn default_trigger_tracks_at_most_a_thousand_users() {
    let (_, manager, store) = setup(Duration::from_secs(60), 10);
    let trigger = BackfillTrigger::new(manager, store);

    for i in 0..=DEFAULT_CAPACITY {
        let handle = trigger
            .on_request(request(&format!("user-{i}"), false))
            .expect("every new user starts a backfill");
        handle.await.unwrap();
    }

    assert_eq!(DEFAULT_CAPACITY, 1000);
    assert_eq!(trigger.tracked_count(), 1000);
    assert!(!trigger.is_tracked("user-0"));
    assert!(trigger.is_tracked("user-1"));
    assert!(trigger.is_tracked(&format!("user-{DEFAULT_CAPACITY}")));
}

#[tokio::test(start_paused = true)]
async fn settings_control_window_and_capacity() {
    let (_, manager, store) = setup(Duration::from_secs(60), 10);
    let settings = Settings {
        backfill_ttl_secs: 30,
        backfill_cache_capacity: 1,
        ..Settings::default()
    };
    let trigger = BackfillTrigger::from_settings(&settings, manager, store);

    trigger.on_request(request("alice", false)).unwrap().await.unwrap();
    trigger.on_request(request("bob", false)).unwrap().await.unwrap();
    assert_eq!(trigger.tracked_count(), 1);
    assert!(!trigger.is_tracked("alice"));

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(!trigger.is_tracked("bob"));
}
