use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per key, created on demand.
///
/// Unrelated keys never contend. Entries nobody holds or waits on are
/// dropped the next time a lock is taken.
pub struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
}

impl<K> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &K) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Keys that currently have a holder or waiter.
    pub fn active(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.values().filter(|m| Arc::strong_count(m) > 1).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes_other_keys_do_not() {
        let locks = Arc::new(KeyedLocks::<String>::new());
        let held = locks.lock(&"a".to_string()).await;

        let other = tokio::time::timeout(Duration::from_millis(50), locks.lock(&"b".to_string())).await;
        assert!(other.is_ok());

        let contended = tokio::time::timeout(Duration::from_millis(50), locks.lock(&"a".to_string())).await;
        assert!(contended.is_err());

        drop(held);
        let again = tokio::time::timeout(Duration::from_millis(50), locks.lock(&"a".to_string())).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn idle_entries_are_dropped() {
        let locks = KeyedLocks::<u32>::new();
        {
            let _a = locks.lock(&1).await;
            let _b = locks.lock(&2).await;
            assert_eq!(locks.active(), 2);
        }
        let _c = locks.lock(&3).await;
        assert_eq!(locks.active(), 1);
    }
}
