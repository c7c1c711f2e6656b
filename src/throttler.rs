use crate::algorithms::{LeakyBucket, Provider, RatioFactor};
use crate::config::ThrottlerConfig;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::storage::{InMemory, Storage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Shortest pause between two admission attempts
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Options for a single throttle decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Wait for capacity instead of answering "blocked" right away
    pub sleep: bool,
    /// Drops the request consumes
    pub increment: u64,
    /// Give up waiting after this long. `None` waits as long as it takes.
    pub max_wait: Option<Duration>,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            sleep: false,
            increment: 1,
            max_wait: None,
        }
    }
}

impl ThrottleOptions {
    pub fn sleeping() -> Self {
        Self {
            sleep: true,
            ..Self::default()
        }
    }

    pub fn with_increment(mut self, increment: u64) -> Self {
        self.increment = increment;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

enum Decision {
    Allowed,
    Blocked,
    Wait(Duration),
}

/// Throttling façade over a rate limiting provider
#[derive(Debug)]
pub struct Throttler<P: Provider = LeakyBucket> {
    provider: P,
}

impl Throttler<LeakyBucket> {
    /// Leaky bucket over in-memory storage, both configured from `config`
    pub fn from_config(config: &ThrottlerConfig) -> ThrottlerResult<Self> {
        config.validate_config()?;

        let drain_time = Duration::try_from_secs_f64(config.capacity as f64 / config.leak_rate)
            .unwrap_or(Duration::MAX);
        if config.ttl < drain_time {
            warn!(
                ttl_ms = config.ttl_ms(),
                drain_ms = drain_time.as_millis() as u64,
                "Storage TTL is shorter than the bucket drain time; idle buckets may be forgotten early"
            );
        }

        let storage: Arc<dyn Storage> = Arc::new(InMemory::from_config(config));
        Ok(Self::new(LeakyBucket::from_config(config)?, Some(storage)))
    }
}

impl<P: Provider> Throttler<P> {
    /// Create a throttler, attaching `storage` to the provider when given
    pub fn new(mut provider: P, storage: Option<Arc<dyn Storage>>) -> Self {
        if let Some(storage) = storage {
            provider.set_storage(storage);
        }
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Throttle a single request without waiting. Returns `true` when blocked.
    pub fn throttle_now(&self, namespace: &str) -> ThrottlerResult<bool> {
        self.throttle(namespace, ThrottleOptions::default())
    }

    /// Throttle a request. Returns `true` when blocked, `false` when allowed.
    ///
    /// With `sleep` set the calling thread waits for capacity, retrying until
    /// the request is admitted or `max_wait` would be exceeded.
    pub fn throttle(&self, namespace: &str, options: ThrottleOptions) -> ThrottlerResult<bool> {
        let deadline = options.max_wait.map(|wait| Instant::now() + wait);
        loop {
            match self.decide(namespace, &options, deadline)? {
                Decision::Allowed => return Ok(false),
                Decision::Blocked => return Ok(true),
                Decision::Wait(wait) => std::thread::sleep(wait),
            }
        }
    }

    /// Async flavour of [`Throttler::throttle`]. Dropping the future cancels the wait.
    pub async fn throttle_async(
        &self,
        namespace: &str,
        options: ThrottleOptions,
    ) -> ThrottlerResult<bool> {
        let deadline = options.max_wait.map(|wait| Instant::now() + wait);
        loop {
            match self.decide(namespace, &options, deadline)? {
                Decision::Allowed => return Ok(false),
                Decision::Blocked => return Ok(true),
                Decision::Wait(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    pub fn ratio(&self, namespace: &str, factor: RatioFactor) -> u64 {
        self.provider.ratio(namespace, factor)
    }

    pub fn usage(&self, namespace: &str) -> ThrottlerResult<u64> {
        self.provider.usage(namespace)
    }

    pub fn limit(&self, namespace: &str) -> u64 {
        self.provider.limit(namespace)
    }

    pub fn has_limit(&self, namespace: &str) -> ThrottlerResult<bool> {
        self.provider.has_limit(namespace)
    }

    pub fn remaining(&self, namespace: &str) -> ThrottlerResult<u64> {
        self.provider.remaining(namespace)
    }

    /// Milliseconds until the next request can go through
    pub fn estimate(&self, namespace: &str) -> ThrottlerResult<u64> {
        self.provider.estimate(namespace)
    }

    /// Milliseconds until the bucket is empty
    pub fn reset(&self, namespace: &str) -> ThrottlerResult<u64> {
        self.provider.reset(namespace)
    }

    /// Try to take `increment` drops. `Ok(false)` means there is no room.
    fn try_admit(&self, namespace: &str, increment: u64) -> ThrottlerResult<bool> {
        if !self.provider.has_limit(namespace)? {
            return Ok(false);
        }

        let usage = self.provider.usage(namespace)?;
        if usage.saturating_add(increment) > self.provider.limit(namespace) {
            return Ok(false);
        }

        match self.provider.increment_usage(namespace, increment) {
            Ok(drops) => {
                trace!(namespace, drops, "Request allowed");
                Ok(true)
            }
            // another caller took the room between the check and the fill
            Err(ThrottlerError::CapacityExceeded { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn decide(
        &self,
        namespace: &str,
        options: &ThrottleOptions,
        deadline: Option<Instant>,
    ) -> ThrottlerResult<Decision> {
        if self.try_admit(namespace, options.increment)? {
            return Ok(Decision::Allowed);
        }
        if !options.sleep {
            return Ok(Decision::Blocked);
        }

        let limit = self.provider.limit(namespace);
        if options.increment > limit {
            debug!(
                namespace,
                increment = options.increment,
                limit,
                "Increment can never fit in the bucket"
            );
            return Ok(Decision::Blocked);
        }

        let wait_ms = self.provider.estimate_for(namespace, options.increment)?;
        let wait = Duration::from_millis(wait_ms).max(MIN_WAIT);

        if let Some(deadline) = deadline {
            if Instant::now() + wait > deadline {
                warn!(
                    namespace,
                    wait_ms = wait.as_millis() as u64,
                    "Giving up, next slot is past the wait deadline"
                );
                return Ok(Decision::Blocked);
            }
        }

        debug!(namespace, wait_ms = wait.as_millis() as u64, "Waiting for the bucket to leak");
        Ok(Decision::Wait(wait))
    }
}
