//! Time-boxed DEK cache.
//!
//! Entries are keyed by `(user id, client-secret fingerprint)` and expire
//! passively: an expired entry is a miss and is purged on the next write.
//! Invalidation bumps an epoch so a derivation that started before the
//! invalidation cannot repopulate the cache with a stale key.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::crypto::kdf::FINGERPRINT_LEN;
use crate::crypto::keys::Dek;

type Fingerprint = [u8; FINGERPRINT_LEN];

struct CacheEntry {
    dek: Dek,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<(String, Fingerprint), CacheEntry>,
    epoch: u64,
}

pub struct DekCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl DekCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Current invalidation epoch.  Read it before deriving and hand it
    /// back to `insert`.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Return a copy of the cached DEK if present and unexpired.
    pub fn get(&self, user_id: &str, fingerprint: &Fingerprint) -> Option<Dek> {
        let mut state = self.state.lock();
        let key = (user_id.to_string(), *fingerprint);
        match state.entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.dek.clone()),
            Some(_) => {
                state.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Cache `dek` unless an invalidation happened since `epoch` was read.
    ///
    /// Returns whether the entry was stored.
    pub fn insert(&self, user_id: &str, fingerprint: Fingerprint, dek: Dek, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return false;
        }

        let now = Instant::now();
        state.entries.retain(|_, entry| entry.expires_at > now);
        state.entries.insert(
            (user_id.to_string(), fingerprint),
            CacheEntry {
                dek,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    /// Drop every cached DEK for `user_id`.
    pub fn invalidate_user(&self, user_id: &str) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        state.entries.retain(|(user, _), _| user != user_id);
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
