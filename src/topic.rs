//! Per-key replay windows.
//!
//! A [`Topic`] holds the most recent batches that touched one key, bounded by
//! `max_size`, plus the subscriptions currently interested in that key. Its
//! lock is held only to copy references in or out; subscriber callbacks never
//! run under it.
//!
//! Subscribers whose cursor predates the oldest retained batch silently miss
//! the evicted batches. That is a documented best-effort window, not an error.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::cursor::Cursor;
use crate::message::MessageBatch;
use crate::subscription::{Subscription, SubscriptionId};

struct TopicInner {
    batches: VecDeque<Arc<MessageBatch>>,
    subscriptions: HashMap<SubscriptionId, Arc<Subscription>>,
}

/// Result of appending a batch to a topic.
pub(crate) struct Appended {
    /// Subscriptions to wake.
    pub subscriptions: Vec<Arc<Subscription>>,
    /// Batch pushed out of the window, if any.
    pub evicted: Option<Arc<MessageBatch>>,
}

/// Ring buffer of batches for one key.
pub struct Topic {
    key: String,
    max_size: usize,
    inner: Mutex<TopicInner>,
}

impl Topic {
    pub fn new(key: impl Into<String>, max_size: usize) -> Self {
        Self {
            key: key.into(),
            max_size: max_size.max(1),
            inner: Mutex::new(TopicInner {
                batches: VecDeque::with_capacity(max_size.clamp(1, 1024)),
                subscriptions: HashMap::new(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of retained batches.
    pub fn len(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the retained batches, oldest first.
    pub fn retained(&self) -> Vec<Arc<MessageBatch>> {
        self.inner.lock().batches.iter().cloned().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    /// Append a batch, evicting the oldest once the window is full.
    pub(crate) fn append(&self, batch: Arc<MessageBatch>) -> Appended {
        let mut inner = self.inner.lock();
        inner.batches.push_back(batch);
        let evicted = if inner.batches.len() > self.max_size {
            inner.batches.pop_front()
        } else {
            None
        };
        Appended {
            subscriptions: inner.subscriptions.values().cloned().collect(),
            evicted,
        }
    }

    /// Copy out retained batches newer than `cursor` and not past `visible`.
    ///
    /// `visible[s]` is the highest sequence id fully applied on stream `s`.
    pub(crate) fn collect_since(
        &self,
        cursor: &Cursor,
        visible: &[u64],
        out: &mut Vec<Arc<MessageBatch>>,
    ) {
        let inner = self.inner.lock();
        out.extend(
            inner
                .batches
                .iter()
                .filter(|b| {
                    let (stream, sequence) = b.position();
                    match visible.get(stream) {
                        Some(&limit) => sequence > cursor.position(stream) && sequence <= limit,
                        None => false,
                    }
                })
                .cloned(),
        );
    }

    pub(crate) fn add_subscription(&self, subscription: Arc<Subscription>) {
        self.inner
            .lock()
            .subscriptions
            .insert(subscription.id(), subscription);
    }

    pub(crate) fn remove_subscription(&self, id: &SubscriptionId) {
        self.inner.lock().subscriptions.remove(id);
    }

    /// Drop every subscription reference (bus shutdown).
    pub(crate) fn clear_subscriptions(&self) -> Vec<Arc<Subscription>> {
        self.inner
            .lock()
            .subscriptions
            .drain()
            .map(|(_, s)| s)
            .collect()
    }
}

/// Lazily populated registry of topics, one per key.
pub struct TopicStore {
    max_size: usize,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl TopicStore {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Topic for `key`, created on first reference.
    pub fn get_or_create(&self, key: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(key) {
            return topic.clone();
        }
        self.topics
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Topic::new(key, self.max_size)))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.topics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every topic.
    pub(crate) fn drain(&self) -> Vec<Arc<Topic>> {
        self.topics.write().drain().map(|(_, t)| t).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn batch(stream: usize, sequence: u64) -> Arc<MessageBatch> {
        Arc::new(MessageBatch::new(
            stream,
            sequence,
            vec![Message::new("k", format!("{stream}:{sequence}"))],
        ))
    }

    fn sequences(batches: &[Arc<MessageBatch>]) -> Vec<u64> {
        batches.iter().map(|b| b.sequence_id()).collect()
    }

    #[test]
    fn test_append_evicts_oldest_past_max_size() {
        let topic = Topic::new("k", 3);
        for seq in 1..=3 {
            assert!(topic.append(batch(0, seq)).evicted.is_none());
        }

        let appended = topic.append(batch(0, 4));
        assert_eq!(appended.evicted.map(|b| b.sequence_id()), Some(1));
        assert_eq!(topic.len(), 3);
        assert_eq!(sequences(&topic.retained()), vec![2, 3, 4]);
    }

    #[test]
    fn test_collect_since_respects_cursor_and_visibility() {
        let topic = Topic::new("k", 10);
        for seq in 5..=8 {
            topic.append(batch(0, seq));
        }
        topic.append(batch(1, 3));

        let mut out = Vec::new();
        topic.collect_since(&Cursor::from_positions([(0, 6)]), &[7, 0], &mut out);
        assert_eq!(sequences(&out), vec![7]);

        out.clear();
        topic.collect_since(&Cursor::new(), &[8, 3], &mut out);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_collect_since_ignores_unknown_streams() {
        let topic = Topic::new("k", 10);
        topic.append(batch(4, 1));

        let mut out = Vec::new();
        topic.collect_since(&Cursor::new(), &[10, 10], &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_cursor_older_than_window_starts_at_oldest() {
        let topic = Topic::new("k", 2);
        for seq in 1..=4 {
            topic.append(batch(0, seq));
        }

        let mut out = Vec::new();
        topic.collect_since(&Cursor::from_positions([(0, 1)]), &[4], &mut out);
        assert_eq!(sequences(&out), vec![3, 4]);
    }

    #[test]
    fn test_store_creates_topics_lazily_once() {
        let store = TopicStore::new(5);
        assert!(store.get("a").is_none());

        let first = store.get_or_create("a");
        let second = store.get_or_create("a");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.max_size(), 5);
        assert_eq!(store.len(), 1);
    }
}
