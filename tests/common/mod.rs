//! Shared utilities for integration tests.
//!
//! Provides bus construction helpers and a recording delivery handler.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use scaleout::utils::retry::{BackoffSchedule, BackoffStep};
use scaleout::{
    BusConfig, Delivery, DeliveryHandler, DeliveryOutcome, MessageBus, SubscriberError,
};

/// Default wait for asynchronous delivery.
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bus config with `stream_count` streams and fast reconnects.
pub fn bus_config(stream_count: usize) -> BusConfig {
    BusConfig {
        stream_count,
        reconnect: BackoffSchedule::new(vec![BackoffStep::new(Duration::from_millis(10), 500)]),
        ..Default::default()
    }
}

/// Poll `condition` until it holds, panicking after `DELIVERY_TIMEOUT`.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(DELIVERY_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// One delivered message as seen by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub key: String,
    pub value: String,
    pub stream: usize,
    pub sequence_id: u64,
}

/// Records every message a subscription receives.
#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<Mutex<Vec<Seen>>>,
    deliveries: Arc<Mutex<usize>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler that records and always continues.
    pub fn handler(&self) -> impl DeliveryHandler + 'static {
        let collector = self.clone();
        move |delivery: Delivery| {
            collector.record(&delivery);
            async { Ok::<_, SubscriberError>(DeliveryOutcome::Continue) }
        }
    }

    pub fn record(&self, delivery: &Delivery) {
        let mut seen = self.seen.lock();
        for batch in delivery.batches() {
            for message in batch.messages() {
                if delivery.keys().iter().any(|k| k == message.key()) {
                    seen.push(Seen {
                        key: message.key().to_string(),
                        value: String::from_utf8_lossy(message.value()).into_owned(),
                        stream: batch.stream_index(),
                        sequence_id: batch.sequence_id(),
                    });
                }
            }
        }
        *self.deliveries.lock() += 1;
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn deliveries(&self) -> usize {
        *self.deliveries.lock()
    }

    /// Values received for `key`, in delivery order.
    pub fn values_for(&self, key: &str) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter(|s| s.key == key)
            .map(|s| s.value.clone())
            .collect()
    }

    pub async fn wait_for(&self, count: usize) {
        wait_until(|| self.len() >= count).await;
    }
}

/// Wait until every stream of `bus` is open.
pub async fn wait_open(bus: &MessageBus) {
    wait_until(|| {
        (0..bus.stream_count()).all(|i| bus.stream_state(i) == Some(scaleout::StreamState::Open))
    })
    .await;
}
