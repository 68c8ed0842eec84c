//! Bounded pool that runs subscription drains.
//!
//! Publishing never runs subscriber code. A publish only queues the affected
//! subscriptions here; each queued subscription gets one spawned task that
//! waits for the subscription's worker lock, then for a pool permit, then
//! drains. The permit bounds how many handlers run at once across the bus.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::subscription::Subscription;

/// Shared delivery concurrency limit.
#[derive(Debug, Clone)]
pub struct DeliveryPool {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl DeliveryPool {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// Run a drain of `subscription` as soon as its worker and a permit are
    /// free.
    pub(crate) fn submit(&self, subscription: Arc<Subscription>) {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // Worker before permit: a subscription already being drained must
            // not hold a slot other subscriptions could use
            let _worker = subscription.worker.lock().await;
            let Ok(_permit) = permits.acquire().await else {
                debug!(subscription = %subscription.id(), "Delivery pool closed, skipping drain");
                return;
            };
            subscription.drain().await;
        });
    }

    /// Stop handing out permits. Pending drains are skipped.
    pub(crate) fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
