//! Per-machine mutual exclusion
//!
//! Create and delete on the same key never overlap. Distinct keys never
//! contend. Entries are created on first use and kept for the lifetime
//! of the table.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use metal_common::ResourceKey;

/// Table of per-key locks
#[derive(Debug, Default)]
pub struct ResourceKeyLock {
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
}

/// Held lock for one key, released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: ResourceKey,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        trace!("Released lock for {}", self.key);
    }
}

impl ResourceKeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other guard for `key` is held
    pub async fn acquire(&self, key: &ResourceKey) -> KeyGuard {
        // Clone the Arc out so the shard lock is not held across the await
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let guard = mutex.lock_owned().await;
        trace!("Acquired lock for {}", key);

        KeyGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(ResourceKeyLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let key = ResourceKey::from_id("r-1");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let active = active.clone();
                let max_seen = max_seen.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let _guard = locks.acquire(&key).await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = ResourceKeyLock::new();
        let _a = locks.acquire(&ResourceKey::from_id("r-1")).await;

        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&ResourceKey::from_id("r-2")),
        )
        .await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let locks = ResourceKeyLock::new();
        let key = ResourceKey::from_id("r-1");

        {
            let guard = locks.acquire(&key).await;
            assert_eq!(guard.key(), &key);
        }

        let again = tokio::time::timeout(Duration::from_millis(100), locks.acquire(&key)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_held_lock_blocks_same_key() {
        let locks = ResourceKeyLock::new();
        let key = ResourceKey::from_id("r-1");
        let _held = locks.acquire(&key).await;

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&key)).await;
        assert!(blocked.is_err());
    }
}
