// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::thread;

use parking_lot::Mutex;
use tracing::debug;

use crate::AppResult;

/// A concurrent set of reusable objects.
///
/// Items are handed out with [`ObjectPool::borrow`] and put back with
/// [`ObjectPool::give_back`]. No ordering is promised between the two, callers
/// must treat the pool as a bag, not a queue. An empty pool is a normal
/// condition: `borrow` returns `None` and the caller applies backpressure.
#[derive(Debug)]
pub struct ObjectPool<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for ObjectPool<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Send> ObjectPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds `count` items in parallel and returns a pool holding all of them.
    ///
    /// The factory receives the index of the item being built. Construction is
    /// spread over at most `num_cpus` scoped threads; the first factory error
    /// aborts the pre-warm.
    pub fn prewarm<F>(count: usize, factory: F) -> AppResult<Self>
    where
        F: Fn(usize) -> AppResult<T> + Sync,
    {
        let workers = num_cpus::get().clamp(1, count.max(1));
        let chunk = count.div_ceil(workers).max(1);
        let factory = &factory;

        let built: Vec<AppResult<Vec<T>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..count)
                .step_by(chunk)
                .map(|start| {
                    let end = (start + chunk).min(count);
                    scope.spawn(move || (start..end).map(factory).collect::<AppResult<Vec<T>>>())
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => Err(crate::AppError::IllegalStateError(
                        "pool pre-warm worker panicked".into(),
                    )),
                })
                .collect()
        });

        let mut items = Vec::with_capacity(count);
        for part in built {
            items.extend(part?);
        }
        debug!("pre-warmed pool with {} objects", items.len());
        Ok(Self {
            items: Mutex::new(items),
        })
    }

    pub fn borrow(&self) -> Option<T> {
        self.items.lock().pop()
    }

    pub fn give_back(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_prewarm_builds_every_item() {
        let pool = ObjectPool::prewarm(37, |i| Ok(i)).unwrap();
        assert_eq!(pool.len(), 37);

        let mut seen = HashSet::new();
        while let Some(item) = pool.borrow() {
            seen.insert(item);
        }
        assert_eq!(seen, (0..37).collect::<HashSet<_>>());
    }

    #[test]
    fn test_prewarm_propagates_factory_error() {
        let result = ObjectPool::prewarm(8, |i| {
            if i == 5 {
                Err(crate::AppError::InvalidValue("boom".into()))
            } else {
                Ok(i)
            }
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_borrow_then_give_back_restores_size() {
        let pool = ObjectPool::prewarm(4, |i| Ok(i)).unwrap();
        let item = pool.borrow().unwrap();
        assert_eq!(pool.len(), 3);
        pool.give_back(item);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_borrow_from_empty_pool_is_none() {
        let pool: ObjectPool<u8> = ObjectPool::new();
        assert!(pool.is_empty());
        assert!(pool.borrow().is_none());
    }

    #[test]
    fn test_concurrent_borrow_and_give_back() {
        let pool = Arc::new(ObjectPool::prewarm(16, |i| Ok(i)).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(item) = pool.borrow() {
                            pool.give_back(item);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.len(), 16);
    }
}
