use super::{Storage, StorageOptions};
use crate::clock::{Clock, MonotonicClock};
use crate::config::ThrottlerConfig;
use crate::error::{ThrottlerError, ThrottlerResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct StorageItem {
    value: String,
    timestamp: Duration,
}

/// Process-local storage with lazy TTL eviction.
pub struct InMemory {
    items: RwLock<HashMap<String, StorageItem>>,
    options: RwLock<StorageOptions>,
    clock: Arc<dyn Clock>,
}

impl InMemory {
    pub fn new() -> Self {
        Self::with_options(StorageOptions::default())
    }

    pub fn with_options(options: StorageOptions) -> Self {
        Self::with_clock(options, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(options: StorageOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            options: RwLock::new(options),
            clock,
        }
    }

    pub fn from_config(config: &ThrottlerConfig) -> Self {
        Self::with_options(StorageOptions::with_ttl(config.ttl_ms()))
    }

    /// Entries currently held, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> ThrottlerResult<usize> {
        let ttl = self.ttl()?;
        let now = self.clock.now();
        let mut items = self.items_mut()?;

        let initial_count = items.len();
        items.retain(|_, item| !is_expired(item, now, ttl));

        Ok(initial_count - items.len())
    }

    /// Periodically purge expired entries on the tokio runtime.
    ///
    /// The task holds a weak reference and exits once the storage is dropped.
    /// Access-time eviction keeps working whether or not a reaper runs.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let storage = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(storage) = storage.upgrade() else {
                    break;
                };
                match storage.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Purged expired storage items"),
                    Err(e) => {
                        warn!(error = %e, "Storage reaper stopping");
                        break;
                    }
                }
            }
        })
    }

    fn ttl(&self) -> ThrottlerResult<Duration> {
        self.options
            .read()
            .map(|options| options.ttl())
            .map_err(|_| ThrottlerError::poisoned("storage options"))
    }

    fn items_mut(&self) -> ThrottlerResult<std::sync::RwLockWriteGuard<'_, HashMap<String, StorageItem>>> {
        self.items
            .write()
            .map_err(|_| ThrottlerError::poisoned("storage items"))
    }

    /// Look up a live entry, evicting it first if it has expired
    fn live_entry<'a>(
        items: &'a mut HashMap<String, StorageItem>,
        key: &str,
        now: Duration,
        ttl: Duration,
    ) -> Option<&'a mut StorageItem> {
        let expired = is_expired(items.get(key)?, now, ttl);
        if expired {
            items.remove(key);
            trace!(key, "Evicted expired storage item");
            return None;
        }
        items.get_mut(key)
    }

    #[cfg(test)]
    fn timestamp_of(&self, key: &str) -> Option<Duration> {
        self.items.read().ok()?.get(key).map(|item| item.timestamp)
    }
}

impl Default for InMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemory")
            .field("items", &self.len())
            .field("options", &self.options.read().ok())
            .field("clock", &self.clock)
            .finish()
    }
}

fn is_expired(item: &StorageItem, now: Duration, ttl: Duration) -> bool {
    now.saturating_sub(item.timestamp) > ttl
}

impl Storage for InMemory {
    fn set_options(&self, options: StorageOptions) -> ThrottlerResult<()> {
        let mut current = self
            .options
            .write()
            .map_err(|_| ThrottlerError::poisoned("storage options"))?;
        *current = options;
        Ok(())
    }

    fn options(&self) -> ThrottlerResult<StorageOptions> {
        self.options
            .read()
            .map(|options| options.clone())
            .map_err(|_| ThrottlerError::poisoned("storage options"))
    }

    fn get_item(&self, key: &str) -> ThrottlerResult<Option<String>> {
        let (ttl, now) = (self.ttl()?, self.clock.now());
        let mut items = self.items_mut()?;
        Ok(Self::live_entry(&mut items, key, now, ttl).map(|item| item.value.clone()))
    }

    fn has_item(&self, key: &str) -> ThrottlerResult<bool> {
        let (ttl, now) = (self.ttl()?, self.clock.now());
        let mut items = self.items_mut()?;
        Ok(Self::live_entry(&mut items, key, now, ttl).is_some())
    }

    fn set_item(&self, key: &str, value: String) -> ThrottlerResult<bool> {
        let (ttl, now) = (self.ttl()?, self.clock.now());
        let mut items = self.items_mut()?;

        match Self::live_entry(&mut items, key, now, ttl) {
            Some(item) => item.value = value,
            None => {
                items.insert(
                    key.to_string(),
                    StorageItem {
                        value,
                        timestamp: now,
                    },
                );
            }
        }
        Ok(true)
    }

    fn replace_item(&self, key: &str, value: String) -> ThrottlerResult<bool> {
        let (ttl, now) = (self.ttl()?, self.clock.now());
        let mut items = self.items_mut()?;

        let item = Self::live_entry(&mut items, key, now, ttl)
            .ok_or_else(|| ThrottlerError::ItemNotFound(key.to_string()))?;
        item.value = value;
        item.timestamp = now;
        Ok(true)
    }

    fn touch_item(&self, key: &str) -> ThrottlerResult<bool> {
        let (ttl, now) = (self.ttl()?, self.clock.now());
        let mut items = self.items_mut()?;

        let item = Self::live_entry(&mut items, key, now, ttl)
            .ok_or_else(|| ThrottlerError::ItemNotFound(key.to_string()))?;
        item.timestamp = now;
        Ok(true)
    }

    fn remove_item(&self, key: &str) -> ThrottlerResult<bool> {
        let (ttl, now) = (self.ttl()?, self.clock.now());
        let mut items = self.items_mut()?;

        if Self::live_entry(&mut items, key, now, ttl).is_none() {
            return Err(ThrottlerError::ItemNotFound(key.to_string()));
        }
        items.remove(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::thread;

    fn storage_with_clock(ttl_ms: u64) -> (InMemory, ManualClock) {
        let clock = ManualClock::new();
        let storage = InMemory::with_clock(StorageOptions::with_ttl(ttl_ms), Arc::new(clock.clone()));
        (storage, clock)
    }

    #[test]
    fn test_construct_without_options() {
        let storage = InMemory::new();
        assert_eq!(storage.options().unwrap(), StorageOptions::default());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_set_options_replaces_ttl() {
        let storage = InMemory::new();
        storage.set_options(StorageOptions::with_ttl(100)).unwrap();
        assert_eq!(storage.options().unwrap().ttl, 100);
        assert_ne!(storage.options().unwrap(), StorageOptions::default());
    }

    #[test]
    fn test_set_new_item() {
        let storage = InMemory::new();
        assert!(storage.set_item("foo", "1".into()).unwrap());
        assert_eq!(storage.len(), 1);
        assert!(storage.has_item("foo").unwrap());
        assert_eq!(storage.get_item("foo").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_set_existing_item_keeps_timestamp() {
        let (storage, clock) = storage_with_clock(10_000);
        storage.set_item("foo", "1".into()).unwrap();
        let first = storage.timestamp_of("foo").unwrap();

        clock.advance(Duration::from_millis(250));
        storage.set_item("foo", "2".into()).unwrap();

        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get_item("foo").unwrap().as_deref(), Some("2"));
        assert_eq!(storage.timestamp_of("foo").unwrap(), first);
    }

    #[test]
    fn test_set_expired_item_starts_fresh() {
        let (storage, clock) = storage_with_clock(100);
        storage.set_item("foo", "1".into()).unwrap();

        clock.advance(Duration::from_millis(500));
        storage.set_item("foo", "2".into()).unwrap();

        assert_eq!(storage.timestamp_of("foo").unwrap(), Duration::from_millis(500));
        assert!(storage.has_item("foo").unwrap());
    }

    #[test]
    fn test_replace_existing_item_refreshes_timestamp() {
        let (storage, clock) = storage_with_clock(10_000);
        storage.set_item("foo", "1".into()).unwrap();
        let first = storage.timestamp_of("foo").unwrap();

        clock.advance(Duration::from_millis(250));
        assert!(storage.replace_item("foo", "2".into()).unwrap());

        assert_eq!(storage.get_item("foo").unwrap().as_deref(), Some("2"));
        assert_ne!(storage.timestamp_of("foo").unwrap(), first);
    }

    #[test]
    fn test_replace_missing_item() {
        let storage = InMemory::new();
        let result = storage.replace_item("foo", "1".into());
        assert!(matches!(result, Err(ThrottlerError::ItemNotFound(key)) if key == "foo"));
    }

    #[test]
    fn test_touch_existing_item() {
        let (storage, clock) = storage_with_clock(10_000);
        storage.set_item("foo", "1".into()).unwrap();
        let first = storage.timestamp_of("foo").unwrap();

        clock.advance(Duration::from_millis(250));
        assert!(storage.touch_item("foo").unwrap());

        assert_ne!(storage.timestamp_of("foo").unwrap(), first);
        assert_eq!(storage.get_item("foo").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_touch_missing_item() {
        let storage = InMemory::new();
        assert!(matches!(
            storage.touch_item("foo"),
            Err(ThrottlerError::ItemNotFound(_))
        ));
    }

    #[test]
    fn test_remove_existing_item() {
        let storage = InMemory::new();
        storage.set_item("foo", "1".into()).unwrap();
        assert!(storage.remove_item("foo").unwrap());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_remove_missing_item() {
        let storage = InMemory::new();
        assert!(matches!(
            storage.remove_item("foo"),
            Err(ThrottlerError::ItemNotFound(_))
        ));
    }

    #[test]
    fn test_expired_item_is_evicted_on_access() {
        let (storage, clock) = storage_with_clock(100);
        storage.set_item("foo", "1".into()).unwrap();

        clock.advance(Duration::from_millis(100));
        assert!(storage.has_item("foo").unwrap());

        clock.advance(Duration::from_millis(1));
        assert_eq!(storage.len(), 1);
        assert!(!storage.has_item("foo").unwrap());
        assert_eq!(storage.len(), 0);
    }

    #[test]
    fn test_expired_item_cannot_be_replaced_or_removed() {
        let (storage, clock) = storage_with_clock(100);
        storage.set_item("foo", "1".into()).unwrap();
        clock.advance(Duration::from_millis(500));

        assert!(matches!(
            storage.replace_item("foo", "2".into()),
            Err(ThrottlerError::ItemNotFound(_))
        ));
        storage.set_item("foo", "1".into()).unwrap();
        clock.advance(Duration::from_millis(500));
        assert!(matches!(
            storage.remove_item("foo"),
            Err(ThrottlerError::ItemNotFound(_))
        ));
    }

    #[test]
    fn test_expiry_with_real_clock() {
        let storage = InMemory::with_options(StorageOptions::with_ttl(100));
        storage.set_item("foo", "1".into()).unwrap();

        thread::sleep(Duration::from_millis(500));
        assert!(!storage.has_item("foo").unwrap());
        assert_eq!(storage.get_item("foo").unwrap(), None);
    }

    #[test]
    fn test_purge_expired() {
        let (storage, clock) = storage_with_clock(100);
        storage.set_item("old", "1".into()).unwrap();
        clock.advance(Duration::from_millis(80));
        storage.set_item("new", "2".into()).unwrap();
        clock.advance(Duration::from_millis(80));

        assert_eq!(storage.purge_expired().unwrap(), 1);
        assert_eq!(storage.len(), 1);
        assert!(storage.has_item("new").unwrap());
    }

    #[tokio::test]
    async fn test_reaper_purges_in_background() {
        let clock = ManualClock::new();
        let storage = Arc::new(InMemory::with_clock(
            StorageOptions::with_ttl(100),
            Arc::new(clock.clone()),
        ));
        storage.set_item("foo", "1".into()).unwrap();
        clock.advance(Duration::from_millis(500));

        let handle = storage.spawn_reaper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(storage.is_empty());

        drop(storage);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper should stop once storage is dropped")
            .unwrap();
    }
}
