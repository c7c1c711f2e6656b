//! Rate limiting algorithms module
//!
//! Algorithms are exposed through the [`Provider`] trait and keep their
//! per-namespace state in a [`Storage`] backend.

pub mod leaky_bucket;
mod locks;

pub use leaky_bucket::{Bucket, LeakyBucket};

use crate::error::{ThrottlerError, ThrottlerResult};
use crate::storage::Storage;
use std::sync::Arc;

/// Multiplier turning a per-second rate into a per-period count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatioFactor(f64);

impl RatioFactor {
    pub const BY_HOUR: Self = Self(3600.0);
    pub const BY_MINUTE: Self = Self(60.0);
    pub const BY_SECOND: Self = Self(1.0);
    pub const BY_MILLISECOND: Self = Self(0.001);

    /// A custom period, in seconds
    pub fn new(seconds: f64) -> ThrottlerResult<Self> {
        if seconds.is_finite() && seconds > 0.0 {
            Ok(Self(seconds))
        } else {
            Err(ThrottlerError::Configuration(format!(
                "Ratio factor must be a positive number, got {}",
                seconds
            )))
        }
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0
    }
}

impl Default for RatioFactor {
    fn default() -> Self {
        Self::BY_SECOND
    }
}

/// Trait for rate limiting algorithms bound to a storage backend
pub trait Provider: Send + Sync {
    fn set_storage(&mut self, storage: Arc<dyn Storage>);

    /// The attached storage, or `StorageNotBound`
    fn storage(&self) -> ThrottlerResult<Arc<dyn Storage>>;

    /// Add `count` to the usage and return the new usage
    fn increment_usage(&self, namespace: &str, count: u64) -> ThrottlerResult<u64>;

    /// Requests permitted per `factor` period
    fn ratio(&self, namespace: &str, factor: RatioFactor) -> u64;

    fn usage(&self, namespace: &str) -> ThrottlerResult<u64>;

    fn limit(&self, namespace: &str) -> u64;

    fn has_limit(&self, namespace: &str) -> ThrottlerResult<bool> {
        Ok(self.limit(namespace) > self.usage(namespace)?)
    }

    fn remaining(&self, namespace: &str) -> ThrottlerResult<u64> {
        Ok(self.limit(namespace).saturating_sub(self.usage(namespace)?))
    }

    /// Milliseconds until the next request can be made
    fn estimate(&self, namespace: &str) -> ThrottlerResult<u64>;

    /// Milliseconds until `count` more drops fit in the bucket
    fn estimate_for(&self, namespace: &str, count: u64) -> ThrottlerResult<u64> {
        if self.usage(namespace)?.saturating_add(count) <= self.limit(namespace) {
            return Ok(0);
        }
        self.estimate(namespace)
    }

    /// Milliseconds until the usage is fully drained
    fn reset(&self, namespace: &str) -> ThrottlerResult<u64>;
}

pub(crate) fn validate_namespace(namespace: &str) -> ThrottlerResult<()> {
    if namespace.is_empty() {
        return Err(ThrottlerError::InvalidNamespace);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_factor_constants() {
        assert_eq!(RatioFactor::BY_HOUR.as_secs_f64(), 3600.0);
        assert_eq!(RatioFactor::BY_MINUTE.as_secs_f64(), 60.0);
        assert_eq!(RatioFactor::default(), RatioFactor::BY_SECOND);
        assert_eq!(RatioFactor::BY_MILLISECOND.as_secs_f64(), 0.001);
    }

    #[test]
    fn test_custom_ratio_factor() {
        assert_eq!(RatioFactor::new(30.0).unwrap().as_secs_f64(), 30.0);
        assert!(RatioFactor::new(0.0).is_err());
        assert!(RatioFactor::new(-1.0).is_err());
        assert!(RatioFactor::new(f64::NAN).is_err());
    }

    #[test]
    fn test_validate_namespace() {
        assert!(validate_namespace("api-key-123").is_ok());
        assert!(matches!(
            validate_namespace(""),
            Err(ThrottlerError::InvalidNamespace)
        ));
    }
}
