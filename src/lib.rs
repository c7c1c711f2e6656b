pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod storage;
pub mod throttler;

pub use algorithms::{Bucket, LeakyBucket, Provider, RatioFactor};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::ThrottlerConfig;
pub use error::{ThrottlerError, ThrottlerResult};
pub use storage::{InMemory, Storage, StorageOptions};
pub use throttler::{ThrottleOptions, Throttler};
