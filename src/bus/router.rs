//! Applies received batches to topics and wakes their subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{trace, warn};

use super::{BusStats, Visibility};
use crate::message::MessageBatch;
use crate::stream::BatchSink;
use crate::subscription::{Subscription, SubscriptionId};
use crate::topic::TopicStore;

/// Receive-side fan-out shared by every stream.
pub(crate) struct TopicRouter {
    topics: Arc<TopicStore>,
    visibility: Arc<Visibility>,
    stats: Arc<BusStats>,
}

impl TopicRouter {
    pub(crate) fn new(
        topics: Arc<TopicStore>,
        visibility: Arc<Visibility>,
        stats: Arc<BusStats>,
    ) -> Self {
        Self {
            topics,
            visibility,
            stats,
        }
    }
}

impl BatchSink for TopicRouter {
    fn apply(&self, batch: Arc<MessageBatch>) {
        let mut woken: HashMap<SubscriptionId, Arc<Subscription>> = HashMap::new();
        let mut evicted = 0;

        for key in batch.keys() {
            let appended = self.topics.get_or_create(key).append(batch.clone());
            if let Some(old) = appended.evicted {
                evicted += 1;
                let (stream, sequence_id) = old.position();
                for subscription in &appended.subscriptions {
                    if subscription.cursor().position(stream) < sequence_id {
                        warn!(
                            subscription = %subscription.id(),
                            key = %key,
                            stream,
                            sequence_id,
                            "Evicted a batch the subscriber has not received"
                        );
                    }
                }
            }
            for subscription in appended.subscriptions {
                woken.entry(subscription.id()).or_insert(subscription);
            }
        }
        self.stats.record_evicted(evicted);

        // Every topic holds the batch now; only then may pulls see it
        self.visibility
            .mark(batch.stream_index(), batch.sequence_id());

        trace!(
            stream = batch.stream_index(),
            sequence_id = batch.sequence_id(),
            subscribers = woken.len(),
            "Batch applied"
        );
        for subscription in woken.into_values() {
            subscription.schedule();
        }
    }
}
