//! Per-key async locks.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex},
};

use tokio::sync::OwnedMutexGuard;

type Locks<K> = Arc<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>;

/// A set of async mutexes created on demand, one per key.
///
/// Entries are removed again once nobody holds or waits for them.
#[derive(Debug)]
pub(crate) struct LockBox<K> {
    locks: Locks<K>,
}

impl<K> Default for LockBox<K> {
    fn default() -> Self {
        Self {
            locks: Default::default(),
        }
    }
}

impl<K: Hash + Eq + Clone> LockBox<K> {
    /// Acquires the lock for `key`, waiting for any current holder to release it.
    pub(crate) async fn lock(&self, key: K) -> LockBoxGuard<K> {
        let lock = {
            let mut locks = self.locks.lock().expect("poisoned");
            locks.entry(key.clone()).or_default().clone()
        };
        let slot = Slot {
            key,
            locks: self.locks.clone(),
            lock,
        };
        let guard = slot.lock.clone().lock_owned().await;
        LockBoxGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// The number of keys currently locked or waited for.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().expect("poisoned").len()
    }
}

/// Holds the lock of one key until dropped.
#[derive(Debug)]
pub(crate) struct LockBoxGuard<K: Hash + Eq> {
    // released before the slot checks whether the entry is still in use
    _guard: OwnedMutexGuard<()>,
    _slot: Slot<K>,
}

/// A reference to a lock entry which cleans the entry up when it is the last one.
#[derive(Debug)]
struct Slot<K: Hash + Eq> {
    key: K,
    locks: Locks<K>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<K: Hash + Eq> Drop for Slot<K> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().expect("poisoned");
        let unused = locks
            .get(&self.key)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2);
        if unused {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::{AtomicUsize, Ordering}, time::Duration};

    use super::*;

    #[tokio::test]
    async fn test_lock_serializes_same_key() {
        let locks = Arc::new(LockBox::<u16>::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(1).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = LockBox::<u16>::default();
        let _a = locks.lock(1).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.lock(2))
            .await
            .expect("different key blocked");
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_cleans_up() {
        let locks = LockBox::<u16>::default();
        let guard = locks.lock(1).await;
        let waiting = tokio::time::timeout(Duration::from_millis(10), locks.lock(1)).await;
        assert!(waiting.is_err());
        drop(guard);
        assert_eq!(locks.len(), 0);
    }
}
