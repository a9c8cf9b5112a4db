//! Synchronization primitives for per-conversation mutual exclusion.

mod keyed;
mod reentrant;

pub use keyed::{KeyedLockRegistry, DEFAULT_RECLAIM_INTERVAL};
pub use reentrant::ReentrantMutex;
