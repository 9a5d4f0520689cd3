use std::fmt::Debug;
use std::hash::Hash;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::ObjectPool;
use crate::AppResult;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool exhausted")]
    Exhausted,

    #[error("key {0} is already borrowed")]
    KeyInUse(String),
}

/// An [`ObjectPool`] whose borrowed items stay reachable by key.
///
/// Borrowing moves an item from the free set into the key map in one step,
/// returning moves it back. Values are cheap handles (typically `Arc`s), the
/// map and the borrower share the same underlying object.
#[derive(Debug)]
pub struct AddressablePool<K, V>
where
    K: Eq + Hash,
{
    free: ObjectPool<V>,
    active: DashMap<K, V>,
}

impl<K, V> AddressablePool<K, V>
where
    K: Eq + Hash + Copy + Debug,
    V: Clone + Send,
{
    pub fn prewarm<F>(count: usize, factory: F) -> AppResult<Self>
    where
        F: Fn(usize) -> AppResult<V> + Sync,
    {
        Ok(Self {
            free: ObjectPool::prewarm(count, factory)?,
            active: DashMap::with_capacity(count),
        })
    }

    /// Takes a free item and maps it under `key`.
    ///
    /// If `key` is already mapped the item goes back to the free set and the
    /// pool is left as it was.
    pub fn borrow(&self, key: K) -> Result<V, PoolError> {
        let item = self.free.borrow().ok_or(PoolError::Exhausted)?;
        match self.active.entry(key) {
            Entry::Occupied(_) => {
                self.free.give_back(item);
                Err(PoolError::KeyInUse(format!("{key:?}")))
            }
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
                Ok(item)
            }
        }
    }

    /// Unmaps `key` and puts its item back into the free set.
    pub fn give_back(&self, key: K) -> Option<V> {
        let (_, item) = self.active.remove(&key)?;
        self.free.give_back(item.clone());
        Some(item)
    }

    pub fn lookup(&self, key: K) -> Option<V> {
        self.active.get(&key).map(|entry| entry.value().clone())
    }

    /// Lazily walks the items mapped at the time of the call.
    ///
    /// Keys are captured up front, values are resolved one at a time without
    /// holding any shard lock between steps. An entry removed mid-walk is
    /// skipped; one added mid-walk is not seen. Call again to restart.
    pub fn enumerate_active(&self) -> impl Iterator<Item = (K, V)> + '_ {
        let keys: Vec<K> = self.active.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(move |key| self.lookup(key).map(|item| (key, item)))
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(count: usize) -> AddressablePool<u64, Arc<usize>> {
        AddressablePool::prewarm(count, |i| Ok(Arc::new(i))).unwrap()
    }

    #[test]
    fn test_borrow_then_give_back_restores_state() {
        let pool = pool(3);
        let item = pool.borrow(7).unwrap();
        assert_eq!(pool.free_len(), 2);
        assert_eq!(pool.active_len(), 1);
        assert!(Arc::ptr_eq(&item, &pool.lookup(7).unwrap()));

        let returned = pool.give_back(7).unwrap();
        assert!(Arc::ptr_eq(&item, &returned));
        assert_eq!(pool.free_len(), 3);
        assert_eq!(pool.active_len(), 0);
        assert!(pool.lookup(7).is_none());
    }

    #[test]
    fn test_duplicate_key_restores_free_item() {
        let pool = pool(2);
        pool.borrow(1).unwrap();
        let err = pool.borrow(1).unwrap_err();
        assert!(matches!(err, PoolError::KeyInUse(_)));
        assert_eq!(pool.free_len(), 1);
        assert_eq!(pool.active_len(), 1);
    }

    #[test]
    fn test_exhausted_pool_reports_backpressure() {
        let pool = pool(1);
        pool.borrow(1).unwrap();
        assert!(matches!(pool.borrow(2), Err(PoolError::Exhausted)));
        assert!(pool.lookup(2).is_none());
    }

    #[test]
    fn test_give_back_unknown_key_is_none() {
        let pool = pool(1);
        assert!(pool.give_back(42).is_none());
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn test_enumerate_active_is_restartable() {
        let pool = pool(4);
        for key in [10, 20, 30] {
            pool.borrow(key).unwrap();
        }
        let mut keys: Vec<u64> = pool.enumerate_active().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![10, 20, 30]);

        pool.give_back(20);
        let mut keys: Vec<u64> = pool.enumerate_active().map(|(k, _)| k).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![10, 30]);
    }

    #[test]
    fn test_removal_during_enumeration_is_skipped() {
        let pool = pool(3);
        for key in [1, 2, 3] {
            pool.borrow(key).unwrap();
        }
        let mut walk = pool.enumerate_active();
        let (first, _) = walk.next().unwrap();
        for key in [1, 2, 3] {
            if key != first {
                pool.give_back(key);
            }
        }
        assert!(walk.next().is_none());
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_concurrent_borrow_and_give_back_by_key() {
        let pool = Arc::new(pool(8));
        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for round in 0..500u64 {
                        let key = worker * 1_000 + round;
                        if pool.borrow(key).is_ok() {
                            assert!(pool.lookup(key).is_some());
                            assert!(pool.give_back(key).is_some());
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.free_len(), 8);
        assert_eq!(pool.active_len(), 0);
    }
}
