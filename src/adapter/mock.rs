//! Scriptable backing store for testing.
//!
//! Behaves like the in-process loop-back store, but failures can be
//! scripted: refuse opens, fail sends, break a stream's connection, or inject
//! receipts with arbitrary sequence ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AdapterError, AdapterEvents, BackingStore, InProcessBackingStore, Result};
use crate::message::Message;

struct Script {
    available: bool,
    fail_opens: u32,
    fail_sends: u32,
    allow_fallback: bool,
}

/// Mock backing store that records sends and fails on demand.
pub struct MockBackingStore {
    inner: InProcessBackingStore,
    script: Mutex<Script>,
    events: Mutex<HashMap<usize, AdapterEvents>>,
    sent: Mutex<Vec<(usize, Vec<Message>)>>,
    open_attempts: AtomicU32,
    fallbacks: AtomicU32,
}

impl Default for MockBackingStore {
    fn default() -> Self {
        Self {
            inner: InProcessBackingStore::new(),
            script: Mutex::new(Script {
                available: true,
                fail_opens: 0,
                fail_sends: 0,
                allow_fallback: false,
            }),
            events: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            open_attempts: AtomicU32::new(0),
            fallbacks: AtomicU32::new(0),
        }
    }
}

impl MockBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable, every open and send fails.
    pub fn set_available(&self, available: bool) {
        self.script.lock().available = available;
    }

    /// Fail the next `count` opens.
    pub fn fail_next_opens(&self, count: u32) {
        self.script.lock().fail_opens = count;
    }

    /// Fail the next `count` sends.
    pub fn fail_next_sends(&self, count: u32) {
        self.script.lock().fail_sends = count;
    }

    /// Whether `fall_back` keeps a stream alive (restoring availability).
    pub fn allow_fallback(&self, allow: bool) {
        self.script.lock().allow_fallback = allow;
    }

    /// Report a broken connection on a stream.
    pub fn disconnect(&self, stream_index: usize) {
        if let Some(events) = self.events.lock().get(&stream_index) {
            events.failed(AdapterError::Connection("mock disconnect".to_string()));
        }
    }

    /// Report that a stream's connection came back on its own.
    pub fn restore(&self, stream_index: usize) {
        if let Some(events) = self.events.lock().get(&stream_index) {
            events.restored();
        }
    }

    /// Deliver a receipt as if another process had published it.
    pub fn inject(&self, stream_index: usize, sequence_id: u64, messages: Vec<Message>) {
        if let Some(events) = self.events.lock().get(&stream_index) {
            events.received(sequence_id, messages);
        }
    }

    pub fn open_attempts(&self) -> u32 {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn fallback_calls(&self) -> u32 {
        self.fallbacks.load(Ordering::SeqCst)
    }

    /// Every batch accepted so far, in acceptance order.
    pub fn sent(&self) -> Vec<(usize, Vec<Message>)> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl BackingStore for MockBackingStore {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, stream_index: usize, events: AdapterEvents) -> Result<()> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script.lock();
            if !script.available {
                return Err(AdapterError::Connection("mock unavailable".to_string()));
            }
            if script.fail_opens > 0 {
                script.fail_opens -= 1;
                return Err(AdapterError::Connection("scripted open failure".to_string()));
            }
        }
        self.events.lock().insert(stream_index, events.clone());
        self.inner.open(stream_index, events).await
    }

    async fn send(&self, stream_index: usize, messages: &[Message]) -> Result<()> {
        {
            let mut script = self.script.lock();
            if !script.available {
                return Err(AdapterError::Send("mock unavailable".to_string()));
            }
            if script.fail_sends > 0 {
                script.fail_sends -= 1;
                return Err(AdapterError::Send("scripted send failure".to_string()));
            }
        }
        self.sent.lock().push((stream_index, messages.to_vec()));
        self.inner.send(stream_index, messages).await
    }

    async fn fall_back(&self, stream_index: usize, events: AdapterEvents) -> Result<bool> {
        self.fallbacks.fetch_add(1, Ordering::SeqCst);
        {
            let mut script = self.script.lock();
            if !script.allow_fallback {
                return Ok(false);
            }
            script.available = true;
        }
        self.events.lock().insert(stream_index, events.clone());
        self.inner.open(stream_index, events).await?;
        Ok(true)
    }

    async fn close(&self, stream_index: usize) {
        self.events.lock().remove(&stream_index);
    }
}
