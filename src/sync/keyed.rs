use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use super::reentrant::ReentrantMutex;

/// Default interval between reclamation sweeps.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

type LockStorage<K> = DashMap<K, Weak<ReentrantMutex>>;

/// Per-key reentrant async mutex with automatic reclamation of unused entries.
///
/// The registry only keeps weak references. Whoever needs mutual exclusion for
/// a key holds the `Arc` returned by [`get_lock`](Self::get_lock) (guards and
/// waiters included), so an entry whose strong count dropped to zero is
/// provably unheld and can be swept without handing out a stale lock.
pub struct KeyedLockRegistry<K> {
    locks: Arc<LockStorage<K>>,
}

impl<K> Clone for KeyedLockRegistry<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> KeyedLockRegistry<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Get or create the lock for `key`.
    ///
    /// Concurrent callers receive the same instance for as long as any of them
    /// keeps a reference to it.
    pub fn get_lock(&self, key: &K) -> Arc<ReentrantMutex> {
        let mut entry = self.locks.entry(key.clone()).or_default();
        if let Some(lock) = entry.upgrade() {
            return lock;
        }
        let lock = Arc::new(ReentrantMutex::new());
        *entry = Arc::downgrade(&lock);
        lock
    }

    /// Run `body` while holding the lock for `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &K, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.get_lock(key);
        lock.with_lock(body).await
    }

    /// Run `body` under the lock for `key`, or `on_busy` if another execution
    /// currently holds it.
    pub async fn try_with_lock<B, BFut, F, Fut, T>(&self, key: &K, on_busy: B, body: F) -> T
    where
        B: FnOnce() -> BFut,
        BFut: Future<Output = T>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.get_lock(key);
        lock.try_with_lock(on_busy, body).await
    }

    /// Remove every entry whose lock is no longer referenced.
    ///
    /// Returns the number of entries removed.
    pub fn reclaim(&self) -> usize {
        reclaim_storage(&self.locks)
    }

    /// Spawn a background task that reclaims unused entries every `interval`.
    ///
    /// The task only holds a weak reference to the registry and stops once the
    /// registry itself has been dropped.
    pub fn spawn_reclaim_task(&self, interval: Duration, name: &'static str) -> JoinHandle<()> {
        let storage = Arc::downgrade(&self.locks);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(locks) = storage.upgrade() else {
                    break;
                };
                let removed = reclaim_storage(&locks);
                if removed > 0 {
                    log::debug!(
                        "Reclaimed {removed} unused {name} locks, {} remaining",
                        locks.len()
                    );
                }
            }
        })
    }

    /// Returns true if the registry currently has an entry for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.locks.contains_key(key)
    }

    /// Return the number of entries, including not yet reclaimed ones.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Return true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K> Default for KeyedLockRegistry<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn reclaim_storage<K: Eq + Hash>(locks: &LockStorage<K>) -> usize {
    let before = locks.len();
    locks.retain(|_, lock| lock.strong_count() > 0);
    before.saturating_sub(locks.len())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn get_returns_same_lock_for_same_key() {
        let locks = KeyedLockRegistry::new();

        let lock1 = locks.get_lock(&"key1");
        let lock2 = locks.get_lock(&"key1");

        assert!(Arc::ptr_eq(&lock1, &lock2));
    }

    #[test]
    fn get_returns_different_locks_for_different_keys() {
        let locks = KeyedLockRegistry::new();

        let lock1 = locks.get_lock(&"key1");
        let lock2 = locks.get_lock(&"key2");

        assert!(!Arc::ptr_eq(&lock1, &lock2));
    }

    #[test]
    fn reclaim_removes_unreferenced_entries() {
        let locks = KeyedLockRegistry::new();

        let held = locks.get_lock(&"held");
        drop(locks.get_lock(&"dropped"));
        assert_eq!(locks.len(), 2);

        let removed = locks.reclaim();

        assert_eq!(removed, 1);
        assert!(locks.contains(&"held"));
        assert!(!locks.contains(&"dropped"));
        drop(held);
        assert_eq!(locks.reclaim(), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn dead_entry_is_replaced_with_a_fresh_lock() {
        let locks = KeyedLockRegistry::new();

        drop(locks.get_lock(&"key"));
        let fresh = locks.get_lock(&"key");

        assert_eq!(Arc::strong_count(&fresh), 1);
        assert_eq!(locks.reclaim(), 0);
        assert!(locks.contains(&"key"));
    }

    #[test]
    fn reclaim_on_empty_is_safe() {
        let locks: KeyedLockRegistry<String> = KeyedLockRegistry::new();
        assert_eq!(locks.reclaim(), 0);
    }

    #[tokio::test]
    async fn entry_survives_while_lock_is_held() {
        let locks = KeyedLockRegistry::new();

        let removed = locks
            .with_lock(&"busy", || async { locks.reclaim() })
            .await;

        assert_eq!(removed, 0);
        assert_eq!(locks.reclaim(), 1);
        assert!(!locks.contains(&"busy"));
    }

    #[tokio::test]
    async fn with_lock_serializes_same_key() {
        let locks = KeyedLockRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock(&"conv", || async {
                        let seen = counter.load(Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        counter.store(seen + 1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn different_keys_lock_concurrently() {
        let locks = KeyedLockRegistry::new();

        let outcome = locks
            .with_lock(&"a", || async {
                locks
                    .try_with_lock(&"b", || async { "busy" }, || async { "acquired" })
                    .await
            })
            .await;

        assert_eq!(outcome, "acquired");
    }

    #[tokio::test]
    async fn background_task_reclaims_dropped_locks() {
        let locks = KeyedLockRegistry::new();
        let task = locks.spawn_reclaim_task(Duration::from_millis(10), "test");

        drop(locks.get_lock(&"gone"));
        for _ in 0..50 {
            if !locks.contains(&"gone") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!locks.contains(&"gone"));
        drop(locks);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reclaim task stops once the registry is dropped")
            .unwrap();
    }
}
