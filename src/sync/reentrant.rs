use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Ids of every `ReentrantMutex` held by the current logical execution.
    static HELD_LOCKS: Arc<Vec<u64>>;
}

/// Async mutex that lets the logical execution already holding it re-enter.
///
/// Ownership is tracked with a task-local set of lock ids rather than a thread
/// id, because a tokio task may resume on any worker thread. The set is
/// propagated into the body of every `with_lock` call, so nested calls made
/// from inside that body (directly or through further awaits) see themselves
/// as the holder and run inline. Work handed to `tokio::spawn` is a different
/// logical execution and has to wait like any other caller.
#[derive(Debug)]
pub struct ReentrantMutex {
    id: u64,
    inner: Mutex<()>,
}

impl ReentrantMutex {
    pub fn new() -> Self {
        Self {
            id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(()),
        }
    }

    /// Returns true when the current logical execution holds this lock.
    pub fn is_held_by_current(&self) -> bool {
        HELD_LOCKS
            .try_with(|held| held.contains(&self.id))
            .unwrap_or(false)
    }

    /// Runs `body` exclusively, or inline when already held by this execution.
    pub async fn with_lock<F, Fut, T>(&self, body: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_held_by_current() {
            return body().await;
        }
        let _guard = self.inner.lock().await;
        HELD_LOCKS.scope(self.held_with_self(), body()).await
    }

    /// Like [`with_lock`](Self::with_lock), but runs `on_busy` instead of
    /// waiting when another execution holds the lock.
    pub async fn try_with_lock<B, BFut, F, Fut, T>(&self, on_busy: B, body: F) -> T
    where
        B: FnOnce() -> BFut,
        BFut: Future<Output = T>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.is_held_by_current() {
            return body().await;
        }
        let _guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(_) => return on_busy().await,
        };
        HELD_LOCKS.scope(self.held_with_self(), body()).await
    }

    fn held_with_self(&self) -> Arc<Vec<u64>> {
        let mut held = HELD_LOCKS
            .try_with(|held| held.as_ref().clone())
            .unwrap_or_default();
        held.push(self.id);
        Arc::new(held)
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}
