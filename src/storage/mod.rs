//! TTL-keyed key/value storage used to persist bucket state.
//!
//! Providers only ever talk to a backend through the [`Storage`] trait, so a
//! networked cache can stand in for [`InMemory`] without touching the
//! algorithm or the throttler.

pub mod in_memory;

pub use in_memory::InMemory;

use crate::config::DEFAULT_TTL;
use crate::error::{ThrottlerError, ThrottlerResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Recognized storage options.
///
/// Deserializing from a map keeps only known keys and fills the rest from
/// the defaults, so unknown keys are dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    /// Item time-to-live in milliseconds
    pub ttl: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL.as_millis() as u64,
        }
    }
}

impl StorageOptions {
    pub fn with_ttl(ttl_ms: u64) -> Self {
        Self { ttl: ttl_ms }
    }

    /// Build options from a loose map, layering recognized keys over the defaults
    pub fn from_map(map: Map<String, Value>) -> ThrottlerResult<Self> {
        serde_json::from_value(Value::Object(map))
            .map_err(|e| ThrottlerError::Configuration(format!("Invalid storage options: {}", e)))
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("ttl".to_string(), Value::from(self.ttl));
        map
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl)
    }
}

/// Capability contract for a TTL key/value store.
///
/// An item is visible only while `now - timestamp <= ttl`. Expired items are
/// evicted when they are next touched.
pub trait Storage: Send + Sync {
    /// Replace the options; recognized keys override the defaults
    fn set_options(&self, options: StorageOptions) -> ThrottlerResult<()>;

    fn options(&self) -> ThrottlerResult<StorageOptions>;

    /// The value for `key`, or `None` when absent or expired
    fn get_item(&self, key: &str) -> ThrottlerResult<Option<String>>;

    /// Whether `key` is present and unexpired. Evicts it if expired.
    fn has_item(&self, key: &str) -> ThrottlerResult<bool>;

    /// Insert or overwrite. Overwriting a live item keeps its TTL clock.
    fn set_item(&self, key: &str, value: String) -> ThrottlerResult<bool>;

    /// Overwrite a live item and restart its TTL clock
    fn replace_item(&self, key: &str, value: String) -> ThrottlerResult<bool>;

    /// Restart the TTL clock of a live item
    fn touch_item(&self, key: &str) -> ThrottlerResult<bool>;

    fn remove_item(&self, key: &str) -> ThrottlerResult<bool>;
}
