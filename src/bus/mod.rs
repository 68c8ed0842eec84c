//! The message bus: publish on one side, fan out to subscribers on the other.
//!
//! This module contains:
//! - `MessageBus`: the orchestrator owning streams, topics and subscriptions
//! - `BusError`: what publish and subscribe can fail with
//! - Supporting pieces: visibility watermarks, the delivery pool, the
//!   receive-side topic router and bus-wide counters
//!
//! Message flow:
//!
//! ```text
//! publish(key) --hash(key) % N--> Stream[i] --send--> BackingStore
//! BackingStore --received(seq)--> Stream[i] applier --> TopicRouter
//! TopicRouter --append--> Topic[key] --schedule--> DeliveryPool --> handler
//! ```
//!
//! Ordering holds per key (a key always hashes to the same stream) and per
//! subscriber (one worker per subscription). Nothing is ordered across
//! streams.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::adapter::{init_backing_store, AdapterError, BackingStore};
use crate::config::{BusConfig, Config, ConfigError};
use crate::cursor::Cursor;
use crate::message::Message;
use crate::stream::{Stream, StreamOptions, StreamState};
use crate::subscription::{DeliveryHandler, Subscription, SubscriptionHandle};
use crate::topic::{Topic, TopicStore};

mod delivery;
mod router;
mod stats;
mod visibility;

pub use delivery::DeliveryPool;
pub use stats::{BusStats, StatsSnapshot};
pub use visibility::Visibility;

use router::TopicRouter;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Stream {stream} is closed")]
    StreamUnavailable { stream: usize },

    #[error("Stream {stream} send queue is full ({capacity} pending)")]
    Backpressure { stream: usize, capacity: usize },

    #[error("Message bus is shut down")]
    ShutDown,

    #[error("Backing store error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

struct BusInner {
    config: BusConfig,
    store: Arc<dyn BackingStore>,
    streams: Vec<Arc<Stream>>,
    topics: Arc<TopicStore>,
    visibility: Arc<Visibility>,
    pool: DeliveryPool,
    stats: Arc<BusStats>,
    subscriptions: Mutex<Vec<Weak<Subscription>>>,
    shut_down: AtomicBool,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // Sender tasks keep their stream alive until aborted
        for stream in &self.streams {
            stream.abort_tasks();
        }
    }
}

/// Sequenced fan-out message bus.
///
/// Cheap to clone; clones share the same streams and subscriptions.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Build the bus and begin opening every stream on `store`.
    ///
    /// Returns as soon as the streams are `Opening`; publishes issued before
    /// a stream is `Open` queue up and flush once it connects.
    pub async fn start(config: BusConfig, store: Arc<dyn BackingStore>) -> Result<Self> {
        config.validate()?;

        let stream_count = config.stream_count;
        let topics = Arc::new(TopicStore::new(config.topic_max_size));
        let visibility = Arc::new(Visibility::new(stream_count));
        let stats = Arc::new(BusStats::default());
        let pool = DeliveryPool::new(config.max_concurrent_deliveries);
        let router = Arc::new(TopicRouter::new(
            topics.clone(),
            visibility.clone(),
            stats.clone(),
        ));
        let options = StreamOptions {
            max_queue_length: config.max_queue_length,
            reconnect: config.reconnect.clone(),
        };

        let streams: Vec<Arc<Stream>> = (0..stream_count)
            .map(|index| {
                Stream::start(
                    index,
                    store.clone(),
                    options.clone(),
                    router.clone(),
                    stats.clone(),
                )
            })
            .collect();
        for stream in &streams {
            stream.open();
        }

        info!(
            streams = stream_count,
            store = store.name(),
            topic_max_size = config.topic_max_size,
            max_queue_length = config.max_queue_length,
            "Message bus started"
        );

        Ok(Self {
            inner: Arc::new(BusInner {
                config,
                store,
                streams,
                topics,
                visibility,
                pool,
                stats,
                subscriptions: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Build the backing store named by `config.adapter`, then start the bus.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let store = init_backing_store(&config.adapter).await?;
        Self::start(config.bus.clone(), store).await
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn stream_count(&self) -> usize {
        self.inner.streams.len()
    }

    /// Backing store name, for logs.
    pub fn store_name(&self) -> &'static str {
        self.inner.store.name()
    }

    /// Stream a key is published on. Stable across processes and restarts.
    pub fn stream_for_key(&self, key: &str) -> usize {
        (xxh3_64(key.as_bytes()) % self.stream_count() as u64) as usize
    }

    pub fn stream_state(&self, stream_index: usize) -> Option<StreamState> {
        self.inner.streams.get(stream_index).map(|s| s.state())
    }

    /// Publishes queued on a stream and not yet accepted by the backing store.
    pub fn pending_sends(&self, stream_index: usize) -> Option<usize> {
        self.inner.streams.get(stream_index).map(|s| s.queue_len())
    }

    /// Publish one message on `key`.
    pub async fn publish(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        is_command: bool,
    ) -> Result<()> {
        self.publish_batch(key, vec![Message::with_flag(key, value, is_command)])
            .await
    }

    /// Publish several messages as one batch, sequenced on the stream of
    /// `partition_key`.
    ///
    /// The messages may carry different keys; each of those keys' topics
    /// receives the whole batch. Resolves once the backing store accepted
    /// the batch, not once subscribers saw it. An empty batch is a no-op.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(partition_key = %partition_key, messages = messages.len()))]
    pub async fn publish_batch(&self, partition_key: &str, messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }

        let stream_index = self.stream_for_key(partition_key);
        let result = self.inner.streams[stream_index].send(messages).await;
        match &result {
            Ok(()) => self.inner.stats.record_published(),
            Err(BusError::Backpressure { .. }) => {
                debug!(stream = stream_index, "Publish rejected, send queue full");
            }
            Err(e) => {
                self.inner.stats.record_rejected();
                warn!(stream = stream_index, error = %e, "Publish failed");
            }
        }
        result
    }

    /// Subscribe to `keys`.
    ///
    /// With a cursor, every retained batch past it is replayed before live
    /// delivery begins; cursor entries for unknown streams are ignored. With
    /// no cursor, delivery starts at whatever is published next.
    ///
    /// The returned handle unsubscribes when dropped.
    #[tracing::instrument(name = "bus.subscribe", skip_all)]
    pub async fn subscribe<K, H>(
        &self,
        keys: impl IntoIterator<Item = K>,
        cursor: Option<Cursor>,
        max_batch_size: Option<usize>,
        handler: H,
    ) -> Result<SubscriptionHandle>
    where
        K: Into<String>,
        H: DeliveryHandler + 'static,
    {
        if self.is_shut_down() {
            return Err(BusError::ShutDown);
        }
        let inner = &self.inner;
        let replay = cursor.is_some();
        let cursor = match cursor {
            Some(cursor) => cursor.fit_to(self.stream_count()),
            None => inner.visibility.cursor(),
        };

        let subscription = Subscription::new(
            cursor,
            Box::new(handler),
            max_batch_size.unwrap_or(inner.config.max_batch_size),
            inner.visibility.clone(),
            inner.pool.clone(),
            inner.stats.clone(),
        );
        inner.stats.record_subscribed();
        for key in keys {
            subscription.attach(inner.topics.get_or_create(&key.into()));
        }
        {
            let mut registry = inner.subscriptions.lock();
            registry.retain(|s| s.strong_count() > 0);
            registry.push(Arc::downgrade(&subscription));
        }
        let handle = SubscriptionHandle::new(subscription.clone(), inner.topics.clone());

        debug!(
            subscription = %subscription.id(),
            keys = ?subscription.keys(),
            replay,
            "Subscribed"
        );

        // Replay inline; live appends queue behind the worker lock meanwhile
        {
            let _worker = subscription.worker.lock().await;
            subscription.drain().await;
        }
        Ok(handle)
    }

    /// Cursor at the latest applied batch on every stream.
    pub fn current_cursor(&self) -> Cursor {
        self.inner.visibility.cursor()
    }

    /// Topic for `key`, if anything was ever published or subscribed on it.
    pub fn topic(&self, key: &str) -> Option<Arc<Topic>> {
        self.inner.topics.get(key)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Close every stream, fail pending publishes, and dispose every
    /// subscription. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        for stream in &inner.streams {
            stream.shutdown().await;
        }

        let registered = std::mem::take(&mut *inner.subscriptions.lock());
        for subscription in registered.iter().filter_map(Weak::upgrade) {
            subscription.dispose();
        }
        for topic in inner.topics.drain() {
            for subscription in topic.clear_subscriptions() {
                subscription.dispose();
            }
        }
        inner.pool.close();

        info!(store = inner.store.name(), "Message bus shut down");
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("streams", &self.stream_count())
            .field("store", &self.store_name())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
