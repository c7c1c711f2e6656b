use crate::error::{ThrottlerError, ThrottlerResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One mutex per namespace, created on demand and dropped once unused.
#[derive(Debug, Default)]
pub(crate) struct NamespaceLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NamespaceLocks {
    /// Run `f` while holding the lock for `namespace`
    pub(crate) fn with_lock<T, F>(&self, namespace: &str, f: F) -> ThrottlerResult<T>
    where
        F: FnOnce() -> ThrottlerResult<T>,
    {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| ThrottlerError::poisoned("namespace locks"))?;
            locks.entry(namespace.to_string()).or_default().clone()
        };

        let result = {
            // guards no data, so a poisoned lock is still usable
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        self.release(namespace, &lock);
        result
    }

    fn release(&self, namespace: &str, lock: &Arc<Mutex<()>>) {
        if let Ok(mut locks) = self.locks.lock() {
            // only the table and this caller still reference it
            if Arc::strong_count(lock) == 2 {
                locks.remove(namespace);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_entry_dropped_after_use() {
        let locks = NamespaceLocks::default();
        let value = locks.with_lock("foo", || Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_error_is_returned_and_entry_released() {
        let locks = NamespaceLocks::default();
        let result: ThrottlerResult<()> =
            locks.with_lock("foo", || Err(ThrottlerError::StorageNotBound));
        assert!(matches!(result, Err(ThrottlerError::StorageNotBound)));
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_same_namespace_is_serialized() {
        let locks = Arc::new(NamespaceLocks::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        locks
                            .with_lock("foo", || {
                                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                max_inside.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_micros(200));
                                inside.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len(), 0);
    }
}
