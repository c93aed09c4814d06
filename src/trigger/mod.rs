//! Opportunistic backfill trigger.
//!
//! Called on every authenticated request.  The first request from a user
//! within the tracking window starts a background backfill; later
//! requests are skipped until the entry expires.  A failed backfill
//! evicts the user so the next request retries.
//!
//! The set of tracked users is bounded: inserting at capacity evicts the
//! oldest-inserted entry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::Settings;
use crate::crypto::keys::ClientSecret;
use crate::manager::KeyManager;
use crate::store::LedgerStore;
use crate::workflows::backfill_user_data;

/// Default tracking window per user.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default maximum number of tracked users.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Insertion-ordered, size-capped map of user id to expiry.
pub struct ProcessedUsers {
    capacity: usize,
    expiries: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl ProcessedUsers {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            expiries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Remove every entry whose expiry has passed.
    pub fn prune_expired(&mut self, now: Instant) {
        let expiries = &mut self.expiries;
        self.order.retain(|user_id| match expiries.get(user_id) {
            Some(expires_at) if *expires_at > now => true,
            _ => {
                expiries.remove(user_id);
                false
            }
        });
    }

    /// Whether `user_id` is tracked and unexpired.
    pub fn is_tracked(&self, user_id: &str, now: Instant) -> bool {
        self.expiries
            .get(user_id)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Track `user_id` until `expires_at`, evicting the oldest entry
    /// first if the map is full.
    pub fn insert(&mut self, user_id: &str, expires_at: Instant) {
        if self.expiries.contains_key(user_id) {
            self.remove(user_id);
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.expiries.remove(&oldest);
                    debug!(user_id = %oldest, "backfill tracking full, evicted oldest user");
                }
                None => break,
            }
        }
        self.order.push_back(user_id.to_string());
        self.expiries.insert(user_id.to_string(), expires_at);
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        if self.expiries.remove(user_id).is_none() {
            return false;
        }
        self.order.retain(|u| u != user_id);
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-request input to the trigger.
pub struct RequestContext {
    pub user_id: String,
    pub client_secret: ClientSecret,
    /// Set when the request asked to skip background work entirely.
    pub skip_backfill: bool,
}

/// Fires background backfills at most once per user per tracking window.
#[derive(Clone)]
pub struct BackfillTrigger {
    manager: Arc<KeyManager>,
    store: Arc<dyn LedgerStore>,
    processed: Arc<Mutex<ProcessedUsers>>,
    ttl: Duration,
}

impl BackfillTrigger {
    pub fn new(manager: Arc<KeyManager>, store: Arc<dyn LedgerStore>) -> Self {
        Self::with_limits(manager, store, DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_limits(
        manager: Arc<KeyManager>,
        store: Arc<dyn LedgerStore>,
        ttl: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            manager,
            store,
            processed: Arc::new(Mutex::new(ProcessedUsers::new(capacity))),
            ttl,
        }
    }

    pub fn from_settings(settings: &Settings, manager: Arc<KeyManager>, store: Arc<dyn LedgerStore>) -> Self {
        Self::with_limits(
            manager,
            store,
            settings.backfill_ttl(),
            settings.backfill_cache_capacity,
        )
    }

    /// Decide whether this request should start a backfill, and start it.
    ///
    /// Never blocks on the backfill and never fails the request.  The
    /// returned handle may be dropped; it is only useful to wait for the
    /// background work (in tests, for instance).
    pub fn on_request(&self, ctx: RequestContext) -> Option<JoinHandle<()>> {
        if ctx.skip_backfill {
            return None;
        }

        {
            let now = Instant::now();
            let mut processed = self.processed.lock();
            processed.prune_expired(now);
            if processed.is_tracked(&ctx.user_id, now) {
                return None;
            }
            processed.insert(&ctx.user_id, now + self.ttl);
        }

        let manager = Arc::clone(&self.manager);
        let store = Arc::clone(&self.store);
        let processed = Arc::clone(&self.processed);

        Some(tokio::spawn(async move {
            let RequestContext {
                user_id,
                client_secret,
                ..
            } = ctx;

            let result = async {
                let dek = manager.derive_or_get_dek(&user_id, &client_secret).await?;
                drop(client_secret);
                backfill_user_data(&user_id, &dek, store.as_ref()).await
            }
            .await;

            if let Err(e) = result {
                error!(user_id = %user_id, error = %e, "background backfill failed");
                if processed.lock().remove(&user_id) {
                    warn!(user_id = %user_id, "evicted from backfill tracking for retry");
                }
            }
        }))
    }

    /// Whether `user_id` is currently tracked as processed.
    pub fn is_tracked(&self, user_id: &str) -> bool {
        self.processed.lock().is_tracked(user_id, Instant::now())
    }

    /// Number of tracked users, expired entries not yet pruned included.
    pub fn tracked_count(&self) -> usize {
        self.processed.lock().len()
    }
}
