use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of async mutexes keyed by session id or project path.
///
/// Waiters on the same key are served in FIFO order, which gives callers
/// per-key submission ordering. Distinct keys never contend.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        entry.value().clone()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.slot(key);
        lock.lock_owned().await
    }

    pub fn try_acquire(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(key).try_lock_owned().ok()
    }

    /// Drops the entry for `key` unless someone still holds or awaits it.
    pub fn forget(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
