//! Subscriptions: registered interest in a set of keys from a cursor.
//!
//! A subscription is pull-based. Appending a batch to one of its topics only
//! flags the subscription as queued and hands it to the delivery pool; the
//! worker then collects every visible batch past the cursor, calls the
//! handler outside all topic locks, and advances the cursor. One worker runs
//! per subscription at a time, which is what keeps per-subscriber order.
//!
//! Cancellation: once `dispose` returns, no new handler invocation starts.
//! A delivery already in flight may finish. `dispose` may be called from
//! inside the handler itself.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error};
use uuid::Uuid;

use crate::bus::{BusStats, DeliveryPool, Visibility};
use crate::cursor::Cursor;
use crate::message::{Message, MessageBatch};
use crate::topic::{Topic, TopicStore};

/// Identifier of a subscription.
pub type SubscriptionId = Uuid;

/// What a handler wants after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Keep delivering.
    Continue,
    /// Unsubscribe after this delivery.
    Terminal,
}

/// Errors returned by delivery handlers.
///
/// Any error unsubscribes the failing subscription. It never reaches the
/// bus's own control flow.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("Delivery failed: {0}")]
    Failed(String),

    #[error("Delivery handler panicked: {0}")]
    Panicked(String),
}

/// Consumer of delivered batches.
pub trait DeliveryHandler: Send + Sync {
    /// Process one delivery.
    fn on_delivery(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'static, Result<DeliveryOutcome, SubscriberError>>;
}

impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<DeliveryOutcome, SubscriberError>> + Send + 'static,
{
    fn on_delivery(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'static, Result<DeliveryOutcome, SubscriberError>> {
        Box::pin(self(delivery))
    }
}

/// Client-facing view of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// Cursor string to resume from after this delivery.
    pub cursor: String,
    /// Command messages, to be applied before `values`.
    pub commands: Vec<Message>,
    /// Ordinary value messages.
    pub values: Vec<Message>,
}

/// One handler invocation's worth of batches.
#[derive(Debug, Clone)]
pub struct Delivery {
    subscription_id: SubscriptionId,
    keys: Vec<String>,
    batches: Vec<Arc<MessageBatch>>,
    cursor: Cursor,
}

impl Delivery {
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Batches in ascending `(stream_index, sequence_id)` order.
    pub fn batches(&self) -> &[Arc<MessageBatch>] {
        &self.batches
    }

    /// Cursor positioned just past this delivery.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    /// Keys the subscription held when the delivery was collected.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Messages addressed to the subscription's keys, in delivery order.
    ///
    /// Batches may carry messages for other keys; those are skipped.
    pub fn messages(&self) -> impl Iterator<Item = &Message> + '_ {
        self.batches
            .iter()
            .flat_map(|b| b.messages().iter())
            .filter(|m| self.keys.binary_search_by(|k| k.as_str().cmp(m.key())).is_ok())
    }

    /// Project the delivery for a client, dropping messages whose key is in
    /// `excluded` (for example "everyone except the sender").
    pub fn project(&self, excluded: &[&str]) -> Projection {
        let (commands, values): (Vec<Message>, Vec<Message>) = self
            .messages()
            .filter(|m| !excluded.contains(&m.key()))
            .cloned()
            .partition(|m| m.is_command());
        Projection {
            cursor: self.cursor.to_string(),
            commands,
            values,
        }
    }
}

/// A registered interest in a set of keys.
pub struct Subscription {
    id: SubscriptionId,
    topics: Mutex<BTreeMap<String, Arc<Topic>>>,
    cursor: Mutex<Cursor>,
    handler: Box<dyn DeliveryHandler>,
    max_batch_size: usize,
    visibility: Arc<Visibility>,
    pool: DeliveryPool,
    stats: Arc<BusStats>,
    queued: AtomicBool,
    disposed: AtomicBool,
    /// Orders handler invocation against dispose; reentrant so a handler
    /// can dispose its own subscription.
    gate: ReentrantMutex<()>,
    /// Held by whichever task is draining this subscription.
    pub(crate) worker: tokio::sync::Mutex<()>,
}

impl Subscription {
    pub(crate) fn new(
        cursor: Cursor,
        handler: Box<dyn DeliveryHandler>,
        max_batch_size: usize,
        visibility: Arc<Visibility>,
        pool: DeliveryPool,
        stats: Arc<BusStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            topics: Mutex::new(BTreeMap::new()),
            cursor: Mutex::new(cursor),
            handler,
            max_batch_size: max_batch_size.max(1),
            visibility,
            pool,
            stats,
            queued: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            gate: ReentrantMutex::new(()),
            worker: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor.lock().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    pub fn is_active(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    /// Start listening on a topic. Returns false if already attached or
    /// disposed.
    pub(crate) fn attach(self: &Arc<Self>, topic: Arc<Topic>) -> bool {
        let mut topics = self.topics.lock();
        if !self.is_active() || topics.contains_key(topic.key()) {
            return false;
        }
        topic.add_subscription(self.clone());
        topics.insert(topic.key().to_string(), topic);
        true
    }

    /// Stop listening on a key.
    pub(crate) fn detach(&self, key: &str) -> bool {
        match self.topics.lock().remove(key) {
            Some(topic) => {
                topic.remove_subscription(&self.id);
                true
            }
            None => false,
        }
    }

    /// Queue a drain on the delivery pool unless one is already pending.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        if !self.queued.swap(true, Ordering::SeqCst) {
            self.pool.submit(self.clone());
        }
    }

    /// Deliver until nothing visible remains past the cursor.
    ///
    /// Callers must hold `worker`.
    pub(crate) async fn drain(&self) {
        loop {
            // Cleared before pulling: any append after this point re-queues
            self.queued.store(false, Ordering::SeqCst);
            if !self.is_active() {
                return;
            }
            let Some(delivery) = self.pull() else {
                return;
            };
            let count = delivery.batches.len() as u64;
            let next_cursor = delivery.cursor.clone();

            let invoked = {
                let _gate = self.gate.lock();
                if !self.is_active() {
                    return;
                }
                std::panic::catch_unwind(AssertUnwindSafe(|| self.handler.on_delivery(delivery)))
            };
            let result = match invoked {
                Ok(future) => AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(SubscriberError::Panicked(panic_message(panic)))),
                Err(panic) => Err(SubscriberError::Panicked(panic_message(panic))),
            };

            match result {
                Ok(outcome) => {
                    *self.cursor.lock() = next_cursor;
                    self.stats.record_delivered(count);
                    if outcome == DeliveryOutcome::Terminal {
                        debug!(subscription = %self.id, "Handler signalled terminal, unsubscribing");
                        self.dispose();
                        return;
                    }
                }
                Err(e) => {
                    error!(
                        subscription = %self.id,
                        error = %e,
                        "Delivery handler failed, unsubscribing"
                    );
                    self.stats.record_subscriber_failure();
                    self.dispose();
                    return;
                }
            }
        }
    }

    /// Collect the next delivery, if anything is visible past the cursor.
    fn pull(&self) -> Option<Delivery> {
        // Visibility first: a batch counts only once it is in every topic
        let visible = self.visibility.snapshot();
        let (keys, topics): (Vec<String>, Vec<Arc<Topic>>) = self
            .topics
            .lock()
            .iter()
            .map(|(k, t)| (k.clone(), t.clone()))
            .unzip();
        let cursor = self.cursor.lock().clone();

        let mut batches = Vec::new();
        for topic in &topics {
            topic.collect_since(&cursor, &visible, &mut batches);
        }
        if batches.is_empty() {
            return None;
        }

        // A batch touching several subscribed keys is found once per topic
        batches.sort_by_key(|b| b.position());
        batches.dedup_by_key(|b| b.position());
        batches.truncate(self.max_batch_size);

        let mut next = cursor;
        for batch in &batches {
            next.advance(batch.stream_index(), batch.sequence_id());
        }

        Some(Delivery {
            subscription_id: self.id,
            keys,
            batches,
            cursor: next,
        })
    }

    /// Unsubscribe. Returns true for the call that actually disposed.
    pub(crate) fn dispose(&self) -> bool {
        {
            let _gate = self.gate.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return false;
            }
        }
        let topics = std::mem::take(&mut *self.topics.lock());
        for topic in topics.values() {
            topic.remove_subscription(&self.id);
        }
        self.stats.record_unsubscribed();
        debug!(subscription = %self.id, "Subscription disposed");
        true
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Disposable handle returned by `MessageBus::subscribe`.
///
/// Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
    topics: Arc<TopicStore>,
}

impl SubscriptionHandle {
    pub(crate) fn new(subscription: Arc<Subscription>, topics: Arc<TopicStore>) -> Self {
        Self {
            subscription,
            topics,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.subscription.id()
    }

    /// Cursor after the last successful delivery.
    pub fn cursor(&self) -> Cursor {
        self.subscription.cursor()
    }

    pub fn keys(&self) -> Vec<String> {
        self.subscription.keys()
    }

    /// False once disposed, terminated by its handler, or failed.
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Join a key (for example a group). Batches on the key newer than the
    /// current cursor are delivered; older ones are not.
    pub fn add_key(&self, key: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        let attached = self.subscription.attach(self.topics.get_or_create(key));
        if attached {
            debug!(subscription = %self.id(), key = %key, "Key added to subscription");
            self.subscription.schedule();
        }
        attached
    }

    /// Leave a key.
    pub fn remove_key(&self, key: &str) -> bool {
        let detached = self.subscription.detach(key);
        if detached {
            debug!(subscription = %self.id(), key = %key, "Key removed from subscription");
        }
        detached
    }

    /// Unsubscribe. Safe to call repeatedly and from inside the handler.
    pub fn dispose(&self) {
        self.subscription.dispose();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.subscription.dispose();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}
