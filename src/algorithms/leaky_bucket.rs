//! Leaky bucket rate limiting algorithm
//!
//! Every request adds drops to a per-namespace bucket, and the bucket drains
//! at a constant rate. Draining is computed lazily from the elapsed time
//! whenever a bucket is read or filled, so no background task is needed.

use super::locks::NamespaceLocks;
use super::{validate_namespace, Provider, RatioFactor};
use crate::clock::{Clock, MonotonicClock};
use crate::config::ThrottlerConfig;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Persisted state of one namespace's bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub drops: u64,
    /// Seconds on the provider clock when the state was last computed
    pub timestamp: f64,
}

impl Bucket {
    pub fn empty(now: f64) -> Self {
        Self {
            drops: 0,
            timestamp: now,
        }
    }
}

pub struct LeakyBucket {
    capacity: u64,
    leak_rate: f64, // drops per second
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
    locks: NamespaceLocks,
}

impl LeakyBucket {
    /// Create a leaky bucket without storage
    pub fn new(capacity: u64, leak_rate: f64) -> ThrottlerResult<Self> {
        if capacity == 0 {
            return Err(ThrottlerError::Configuration(
                "Bucket capacity must be greater than 0".to_string(),
            ));
        }
        if !(leak_rate.is_finite() && leak_rate > 0.0) {
            return Err(ThrottlerError::Configuration(format!(
                "Leak rate must be a positive number, got {}",
                leak_rate
            )));
        }

        Ok(Self {
            capacity,
            leak_rate,
            storage: None,
            clock: Arc::new(MonotonicClock::new()),
            locks: NamespaceLocks::default(),
        })
    }

    pub fn with_storage(
        capacity: u64,
        leak_rate: f64,
        storage: Arc<dyn Storage>,
    ) -> ThrottlerResult<Self> {
        let mut bucket = Self::new(capacity, leak_rate)?;
        bucket.set_storage(storage);
        Ok(bucket)
    }

    pub fn from_config(config: &ThrottlerConfig) -> ThrottlerResult<Self> {
        Self::new(config.capacity, config.leak_rate)
    }

    /// Swap the time source used for leak arithmetic
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn leak_rate(&self) -> f64 {
        self.leak_rate
    }

    /// Drain the drops that leaked out since the bucket was last computed
    fn leak(&self, mut bucket: Bucket, now: f64) -> Bucket {
        let elapsed = (now - bucket.timestamp).max(0.0);
        let leakage = (elapsed * self.leak_rate).round();

        bucket.drops = if leakage <= bucket.drops as f64 {
            bucket.drops - leakage as u64
        } else {
            0
        };
        bucket.timestamp = now;
        bucket
    }

    /// Load the bucket for `namespace` with pending leakage applied
    fn load_bucket(&self, storage: &dyn Storage, namespace: &str) -> ThrottlerResult<Bucket> {
        let now = self.clock.now_secs();
        match storage.get_item(namespace)? {
            Some(payload) => {
                let mut stored: Bucket = serde_json::from_str(&payload)?;
                // another writer may have used a larger capacity
                stored.drops = stored.drops.min(self.capacity);
                let leaked = self.leak(stored, now);
                trace!(
                    namespace,
                    before = stored.drops,
                    after = leaked.drops,
                    "Leaked bucket"
                );
                Ok(leaked)
            }
            None => Ok(Bucket::empty(now)),
        }
    }

    /// Persist a bucket. Fills restart the storage TTL, leak-only updates do not.
    fn save_bucket(
        &self,
        storage: &dyn Storage,
        namespace: &str,
        bucket: &Bucket,
        refresh_ttl: bool,
    ) -> ThrottlerResult<()> {
        let payload = serde_json::to_string(bucket)?;

        if refresh_ttl {
            match storage.replace_item(namespace, payload.clone()) {
                Ok(_) => return Ok(()),
                // first fill, or the previous bucket expired
                Err(ThrottlerError::ItemNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        storage.set_item(namespace, payload)?;
        Ok(())
    }

    /// Load, leak and persist the bucket for `namespace`
    fn current_bucket(&self, namespace: &str) -> ThrottlerResult<Bucket> {
        validate_namespace(namespace)?;
        let storage = self.storage()?;

        self.locks.with_lock(namespace, || {
            let bucket = self.load_bucket(storage.as_ref(), namespace)?;
            self.save_bucket(storage.as_ref(), namespace, &bucket, false)?;
            Ok(bucket)
        })
    }
}

impl fmt::Debug for LeakyBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeakyBucket")
            .field("capacity", &self.capacity)
            .field("leak_rate", &self.leak_rate)
            .field("storage_bound", &self.storage.is_some())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Provider for LeakyBucket {
    fn set_storage(&mut self, storage: Arc<dyn Storage>) {
        self.storage = Some(storage);
    }

    fn storage(&self) -> ThrottlerResult<Arc<dyn Storage>> {
        self.storage.clone().ok_or(ThrottlerError::StorageNotBound)
    }

    fn increment_usage(&self, namespace: &str, count: u64) -> ThrottlerResult<u64> {
        validate_namespace(namespace)?;
        let storage = self.storage()?;

        self.locks.with_lock(namespace, || {
            let mut bucket = self.load_bucket(storage.as_ref(), namespace)?;
            let candidate = bucket.drops.saturating_add(count);

            if candidate > self.capacity {
                // keep the leak, reject the fill
                self.save_bucket(storage.as_ref(), namespace, &bucket, false)?;
                debug!(
                    namespace,
                    drops = bucket.drops,
                    requested = count,
                    capacity = self.capacity,
                    "Bucket capacity exceeded"
                );
                return Err(ThrottlerError::CapacityExceeded {
                    namespace: namespace.to_string(),
                    requested: count,
                    available: self.capacity.saturating_sub(bucket.drops),
                });
            }

            bucket.drops = candidate;
            bucket.timestamp = self.clock.now_secs();
            self.save_bucket(storage.as_ref(), namespace, &bucket, true)?;

            Ok(bucket.drops)
        })
    }

    fn ratio(&self, _namespace: &str, factor: RatioFactor) -> u64 {
        (self.leak_rate * factor.as_secs_f64()).ceil() as u64
    }

    fn usage(&self, namespace: &str) -> ThrottlerResult<u64> {
        Ok(self.current_bucket(namespace)?.drops)
    }

    fn limit(&self, _namespace: &str) -> u64 {
        self.capacity
    }

    fn estimate(&self, namespace: &str) -> ThrottlerResult<u64> {
        if self.has_limit(namespace)? {
            return Ok(0);
        }
        // one drop has to leak out
        Ok((1000.0 / self.leak_rate).ceil() as u64)
    }

    fn estimate_for(&self, namespace: &str, count: u64) -> ThrottlerResult<u64> {
        let drops = self.current_bucket(namespace)?.drops;
        let missing = drops.saturating_add(count).saturating_sub(self.capacity);
        if missing == 0 {
            return Ok(0);
        }
        Ok((missing as f64 * 1000.0 / self.leak_rate).ceil() as u64)
    }

    fn reset(&self, namespace: &str) -> ThrottlerResult<u64> {
        let bucket = self.current_bucket(namespace)?;

        if bucket.drops > 0 {
            let seconds = (bucket.drops as f64 / self.leak_rate).ceil();
            return Ok((seconds * 1000.0) as u64);
        }
        Ok(0)
    }
}
