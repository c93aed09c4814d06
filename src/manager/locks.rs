//! Per-user serialization of key-changing operations.
//!
//! Each user id maps to its own async mutex, so a second credential
//! change for the same user waits for the first while other users never
//! contend.  An entry is removed once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Slot>>,
}

struct Slot {
    lock: Arc<AsyncMutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

/// Registration in the lock table, held while waiting and while locked.
struct SlotRef<'a> {
    owner: &'a UserLocks,
    user_id: String,
}

/// Held for the duration of one serialized operation.
pub struct UserLockGuard<'a> {
    // Field order matters: the mutex is released before the slot.
    _guard: OwnedMutexGuard<()>,
    _slot: SlotRef<'a>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`'s key state.
    ///
    /// Dropping the returned future before it completes still releases
    /// this caller's claim on the table entry.
    pub async fn lock(&self, user_id: &str) -> UserLockGuard<'_> {
        let (slot, lock) = {
            let mut locks = self.locks.lock();
            let entry = locks.entry(user_id.to_string()).or_insert_with(|| Slot {
                lock: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            entry.users += 1;
            let slot = SlotRef {
                owner: self,
                user_id: user_id.to_string(),
            };
            (slot, entry.lock.clone())
        };

        let guard = lock.lock_owned().await;
        UserLockGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// Number of users with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SlotRef<'_> {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock();
        if let Some(slot) = locks.get_mut(&self.user_id) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(&self.user_id);
            }
        }
    }
}
