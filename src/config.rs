use crate::error::{ThrottlerError, ThrottlerResult};
use humantime_serde::re::humantime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Bucket capacity used when none is configured.
pub const DEFAULT_CAPACITY: u64 = 10;
/// Drops leaked per second when none is configured.
pub const DEFAULT_LEAK_RATE: f64 = 1.0;
/// Storage TTL used when none is configured (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_millis(300_000);

/// Throttler configuration, loadable from the environment or JSON.
///
/// Durations accept humantime strings (`"5m"`, `"250ms"`). From the
/// environment a bare integer is read as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ThrottlerConfig {
    /// Maximum drops a bucket can hold
    #[validate(range(min = 1, message = "capacity must be greater than 0"))]
    pub capacity: u64,

    /// Drops drained per second
    #[validate(range(exclusive_min = 0.0, message = "leak rate must be greater than 0"))]
    pub leak_rate: f64,

    /// How long an idle bucket survives in storage
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Upper bound for a sleeping throttle call, unbounded when absent
    #[serde(with = "humantime_serde")]
    pub max_wait: Option<Duration>,

    /// Log level for the binary's tracing subscriber
    pub log_level: String,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            leak_rate: DEFAULT_LEAK_RATE,
            ttl: DEFAULT_TTL,
            max_wait: None,
            log_level: "info".to_string(),
        }
    }
}

impl ThrottlerConfig {
    /// Load configuration from `.env` and the process environment
    pub fn from_env() -> ThrottlerResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> ThrottlerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("THROTTLER_CAPACITY") {
            config.capacity = value.trim().parse().map_err(|e| {
                ThrottlerError::Configuration(format!("Invalid THROTTLER_CAPACITY '{}': {}", value, e))
            })?;
        }
        if let Some(value) = lookup("THROTTLER_LEAK_RATE") {
            config.leak_rate = value.trim().parse().map_err(|e| {
                ThrottlerError::Configuration(format!("Invalid THROTTLER_LEAK_RATE '{}': {}", value, e))
            })?;
        }
        if let Some(value) = lookup("THROTTLER_TTL") {
            config.ttl = parse_duration("THROTTLER_TTL", &value)?;
        }
        if let Some(value) = lookup("THROTTLER_MAX_WAIT") {
            config.max_wait = Some(parse_duration("THROTTLER_MAX_WAIT", &value)?);
        }
        if let Some(value) = lookup("THROTTLER_LOG_LEVEL") {
            config.log_level = value.trim().to_string();
        }

        config.validate_config()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> ThrottlerResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ThrottlerError::Configuration(format!("Invalid configuration: {}", e)))?;
        config.validate_config()?;
        Ok(config)
    }

    /// Validate field ranges
    pub fn validate_config(&self) -> ThrottlerResult<()> {
        self.validate()?;
        if !self.leak_rate.is_finite() {
            return Err(ThrottlerError::Configuration(
                "leak rate must be a finite number".to_string(),
            ));
        }
        Ok(())
    }

    /// TTL in whole milliseconds, as storage options expect it
    pub fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

fn parse_duration(name: &str, value: &str) -> ThrottlerResult<Duration> {
    let value = value.trim();
    if let Ok(ms) = value.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }
    humantime::parse_duration(value)
        .map_err(|e| ThrottlerError::Configuration(format!("Invalid {} '{}': {}", name, value, e)))
}
