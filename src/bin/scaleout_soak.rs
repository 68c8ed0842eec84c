//! scaleout-soak: publish/subscribe soak run
//!
//! Starts a bus from configuration, subscribes one handler per key, publishes
//! concurrently on every key and checks that each subscriber saw its key's
//! messages exactly once and in publish order.
//!
//! ## Configuration
//! - SCALEOUT_CONFIG / SCALEOUT__*: bus and backing store settings
//! - SOAK_KEYS: number of keys (default: 8)
//! - SOAK_MESSAGES: messages per key (default: 1000)
//!
//! Point two instances at the same Redis to watch cross-process fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};

use scaleout::config::Config;
use scaleout::utils::bootstrap::init_tracing;
use scaleout::{BusError, Delivery, DeliveryOutcome, MessageBus, SubscriberError};

const DEFAULT_KEYS: usize = 8;
const DEFAULT_MESSAGES: u64 = 1000;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let keys = env_or("SOAK_KEYS", DEFAULT_KEYS);
    let per_key = env_or("SOAK_MESSAGES", DEFAULT_MESSAGES);

    let bus = MessageBus::from_config(&config).await?;
    info!(
        store = bus.store_name(),
        streams = bus.stream_count(),
        keys,
        per_key,
        "scaleout-soak started"
    );

    let mut handles = Vec::with_capacity(keys);
    let mut seen = Vec::with_capacity(keys);
    for k in 0..keys {
        let key = format!("soak-{k}");
        let received = Arc::new(Mutex::new(Vec::<u64>::new()));
        let sink = received.clone();
        let handle = bus
            .subscribe([key.clone()], None, None, move |delivery: Delivery| {
                let sink = sink.clone();
                async move {
                    let mut values = Vec::new();
                    for message in delivery.messages() {
                        let value = std::str::from_utf8(message.value())
                            .ok()
                            .and_then(|text| text.parse::<u64>().ok())
                            .ok_or_else(|| SubscriberError::Failed("non-numeric soak value".to_string()))?;
                        values.push(value);
                    }
                    sink.lock().extend(values);
                    Ok::<_, SubscriberError>(DeliveryOutcome::Continue)
                }
            })
            .await?;
        handles.push(handle);
        seen.push((key, received));
    }

    let started = Instant::now();
    let mut publishers = Vec::with_capacity(keys);
    for (key, _) in &seen {
        let bus = bus.clone();
        let key = key.clone();
        publishers.push(tokio::spawn(async move {
            let mut backpressured = 0u64;
            let mut n = 0;
            while n < per_key {
                match bus.publish(&key, n.to_string(), false).await {
                    Ok(()) => n += 1,
                    Err(BusError::Backpressure { .. }) => {
                        backpressured += 1;
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(backpressured)
        }));
    }

    let mut backpressured = 0;
    for publisher in publishers {
        backpressured += publisher.await??;
    }
    let published_in = started.elapsed();

    // Give subscribers a bounded window to catch up
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline
        && seen
            .iter()
            .any(|(_, received)| (received.lock().len() as u64) < per_key)
    {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut failures = 0;
    for (key, received) in &seen {
        let received = received.lock();
        let in_order = received.iter().copied().eq(0..per_key);
        if !in_order {
            failures += 1;
            error!(key = %key, received = received.len(), expected = per_key, "Key delivered out of order or incomplete");
        }
    }

    let stats = bus.stats();
    info!(
        elapsed_ms = published_in.as_millis() as u64,
        published = stats.published,
        backpressured,
        delivered_batches = stats.delivered_batches,
        duplicates_dropped = stats.duplicates_dropped,
        evicted = stats.evicted,
        "scaleout-soak finished"
    );

    drop(handles);
    bus.shutdown().await;

    if failures > 0 {
        warn!(failures, "Soak run failed");
        std::process::exit(1);
    }
    Ok(())
}
