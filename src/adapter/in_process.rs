//! In-process backing store.
//!
//! Loops every sent batch straight back into its own stream. Nothing leaves
//! the process, so this is the single-node reference store and the default
//! for local development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{AdapterError, AdapterEvents, BackingStore, Result};
use crate::message::Message;

/// Per-stream loop-back state.
struct Loopback {
    events: AdapterEvents,
    last_sequence: u64,
}

/// Loop-back store assigning sequence ids from a per-stream counter.
///
/// The counter survives re-opens, which is how this store restores its last
/// known sequence after a reconnect.
#[derive(Default)]
pub struct InProcessBackingStore {
    streams: Mutex<HashMap<usize, Loopback>>,
}

impl InProcessBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence id handed out on a stream (0 before the first send).
    pub fn last_sequence(&self, stream_index: usize) -> u64 {
        self.streams
            .lock()
            .get(&stream_index)
            .map(|s| s.last_sequence)
            .unwrap_or(0)
    }
}

#[async_trait]
impl BackingStore for InProcessBackingStore {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn open(&self, stream_index: usize, events: AdapterEvents) -> Result<()> {
        let mut streams = self.streams.lock();
        match streams.get_mut(&stream_index) {
            Some(existing) => {
                existing.events = events;
                debug!(
                    stream = stream_index,
                    last_sequence = existing.last_sequence,
                    "Loop-back stream reopened"
                );
            }
            None => {
                streams.insert(
                    stream_index,
                    Loopback {
                        events,
                        last_sequence: 0,
                    },
                );
                info!(stream = stream_index, "Loop-back stream opened");
            }
        }
        Ok(())
    }

    async fn send(&self, stream_index: usize, messages: &[Message]) -> Result<()> {
        // Assignment and hand-off happen under one lock so ids reach the
        // stream in the order they were assigned
        let mut streams = self.streams.lock();
        let stream = streams
            .get_mut(&stream_index)
            .ok_or(AdapterError::NotOpen(stream_index))?;

        stream.last_sequence += 1;
        stream.events.received(stream.last_sequence, messages.to_vec());
        Ok(())
    }
}
