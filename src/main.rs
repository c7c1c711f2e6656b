use anyhow::Result;
use clap::Parser;
use humantime_serde::re::humantime;
use std::time::Duration;
use throttler::{ThrottleOptions, Throttler, ThrottlerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Replay a burst of requests through a leaky bucket throttler
#[derive(Debug, Parser)]
#[command(name = "throttler", version, about)]
struct Args {
    /// Namespace the requests are counted against
    #[arg(short, long, default_value = "demo")]
    namespace: String,

    /// Number of requests to send
    #[arg(short, long, default_value_t = 20)]
    requests: u32,

    /// Drops consumed by each request
    #[arg(short, long, default_value_t = 1)]
    increment: u64,

    /// Wait for capacity instead of rejecting
    #[arg(short, long)]
    sleep: bool,

    /// Override THROTTLER_CAPACITY
    #[arg(long)]
    capacity: Option<u64>,

    /// Override THROTTLER_LEAK_RATE
    #[arg(long)]
    leak_rate: Option<f64>,

    /// Override THROTTLER_TTL (e.g. "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    ttl: Option<Duration>,

    /// Override THROTTLER_MAX_WAIT (e.g. "3s")
    #[arg(long, value_parser = humantime::parse_duration)]
    max_wait: Option<Duration>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration from .env and the environment, then apply flags
    let mut config = ThrottlerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(leak_rate) = args.leak_rate {
        config.leak_rate = leak_rate;
    }
    if let Some(ttl) = args.ttl {
        config.ttl = ttl;
    }
    if args.max_wait.is_some() {
        config.max_wait = args.max_wait;
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("throttler={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        capacity = config.capacity,
        leak_rate = config.leak_rate,
        ttl_ms = config.ttl_ms(),
        "Starting throttler"
    );

    let throttler = Throttler::from_config(&config)
        .map_err(|e| anyhow::anyhow!("Failed to create throttler: {}", e))?;

    let options = ThrottleOptions {
        sleep: args.sleep,
        increment: args.increment,
        max_wait: config.max_wait,
    };

    let mut allowed = 0;
    for request in 1..=args.requests {
        let blocked = throttler.throttle(&args.namespace, options)?;
        if !blocked {
            allowed += 1;
        }
        tracing::info!(
            request,
            namespace = %args.namespace,
            allowed = !blocked,
            remaining = throttler.remaining(&args.namespace)?,
            "Throttle decision"
        );
    }

    tracing::info!(
        allowed,
        blocked = args.requests - allowed,
        usage = throttler.usage(&args.namespace)?,
        reset_ms = throttler.reset(&args.namespace)?,
        estimate_ms = throttler.estimate(&args.namespace)?,
        "Finished"
    );

    Ok(())
}
