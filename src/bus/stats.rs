//! Bus-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters updated on the hot path.
///
/// All loads and stores are relaxed; a snapshot is a best-effort view, not a
/// consistent cut.
#[derive(Debug, Default)]
pub struct BusStats {
    /// Publish calls acknowledged by their stream.
    published: AtomicU64,
    /// Publish calls rejected because the send queue was full.
    backpressured: AtomicU64,
    /// Publish calls rejected for any other reason.
    rejected: AtomicU64,
    /// Batches applied from backing store receipts.
    received: AtomicU64,
    /// Receipts dropped because their sequence id was already applied.
    duplicates_dropped: AtomicU64,
    /// Batches pushed out of a topic window.
    evicted: AtomicU64,
    /// Batches handed to subscription handlers.
    delivered_batches: AtomicU64,
    /// Handler errors and panics.
    subscriber_failures: AtomicU64,
    subscribed: AtomicU64,
    unsubscribed: AtomicU64,
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub published: u64,
    pub backpressured: u64,
    pub rejected: u64,
    pub received: u64,
    pub duplicates_dropped: u64,
    pub evicted: u64,
    pub delivered_batches: u64,
    pub subscriber_failures: u64,
    pub active_subscriptions: u64,
}

impl BusStats {
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressured(&self) {
        self.backpressured.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self, count: u64) {
        if count > 0 {
            self.evicted.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_delivered(&self, batches: u64) {
        self.delivered_batches.fetch_add(batches, Ordering::Relaxed);
    }

    pub(crate) fn record_subscriber_failure(&self) {
        self.subscriber_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_subscribed(&self) {
        self.subscribed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unsubscribed(&self) {
        self.unsubscribed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        let subscribed = self.subscribed.load(Ordering::Relaxed);
        let unsubscribed = self.unsubscribed.load(Ordering::Relaxed);
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            backpressured: self.backpressured.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            subscriber_failures: self.subscriber_failures.load(Ordering::Relaxed),
            active_subscriptions: subscribed.saturating_sub(unsubscribed),
        }
    }
}
