//! Redis backing store.
//!
//! Each stream maps to a counter key `{prefix}:stream:{index}` and a pub/sub
//! channel `{prefix}:stream:{index}:batches`. `send` runs one Lua script that
//! `INCR`s the counter and `PUBLISH`es the envelope carrying the new id, so
//! ids are assigned and published atomically and every process subscribed to
//! the channel sees them in the same order.
//!
//! Each open stream holds a dedicated pub/sub connection. When it drops the
//! store reports `failed` and the stream's reconnect driver calls `open`
//! again, which resubscribes and reads the counter back to detect batches
//! published while disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ::redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AdapterError, AdapterEvents, BackingStore, RedisConfig, Result};
use crate::codec::{decode_envelope, encode_payload};
use crate::message::Message;

/// Assigns the next id and publishes `envelope(id, payload)` atomically.
///
/// KEYS[1] = counter, KEYS[2] = channel, ARGV[1] = encoded payload.
const PUBLISH_SCRIPT: &str = r#"
local id = redis.call('INCR', KEYS[1])
local payload = ARGV[1]
redis.call('PUBLISH', KEYS[2], struct.pack('<i8i4', id, string.len(payload)) .. payload)
return id
"#;

struct Relay {
    task: JoinHandle<()>,
    last_sequence: Arc<AtomicU64>,
}

/// Redis INCR + PUBLISH relay.
pub struct RedisBackingStore {
    client: Client,
    conn: ConnectionManager,
    key_prefix: String,
    script: Script,
    relays: Mutex<HashMap<usize, Relay>>,
}

impl RedisBackingStore {
    /// Connect to Redis.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(url = %config.url, key_prefix = %config.key_prefix, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            key_prefix: config.key_prefix.clone(),
            script: Script::new(PUBLISH_SCRIPT),
            relays: Mutex::new(HashMap::new()),
        })
    }

    /// Counter key for a stream.
    fn counter_key(&self, stream_index: usize) -> String {
        format!("{}:stream:{}", self.key_prefix, stream_index)
    }

    /// Pub/sub channel for a stream.
    fn channel(&self, stream_index: usize) -> String {
        format!("{}:stream:{}:batches", self.key_prefix, stream_index)
    }

    /// Last sequence id seen on a stream by this process (0 before any).
    pub fn last_sequence(&self, stream_index: usize) -> u64 {
        self.relays
            .lock()
            .get(&stream_index)
            .map(|r| r.last_sequence.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn stop_relay(&self, stream_index: usize) -> Option<Arc<AtomicU64>> {
        self.relays.lock().remove(&stream_index).map(|relay| {
            relay.task.abort();
            relay.last_sequence
        })
    }
}

#[async_trait]
impl BackingStore for RedisBackingStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn open(&self, stream_index: usize, events: AdapterEvents) -> Result<()> {
        let previous = self.stop_relay(stream_index);
        let channel = self.channel(stream_index);

        // Subscribe before reading the counter so nothing published in
        // between is lost
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let mut conn = self.conn.clone();
        let current: Option<u64> = conn.get(self.counter_key(stream_index)).await?;
        let current = current.unwrap_or(0);

        let reopened = previous.is_some();
        let last_sequence = previous.unwrap_or_default();
        let seen = last_sequence.load(Ordering::SeqCst);
        if reopened && current > seen {
            warn!(
                stream = stream_index,
                last_seen = seen,
                current,
                missed = current - seen,
                "Batches published while disconnected were not received"
            );
        }
        last_sequence.fetch_max(current, Ordering::SeqCst);

        let relay_sequence = last_sequence.clone();
        let relay_events = events.clone();
        let task = tokio::spawn(async move {
            let mut messages = std::pin::pin!(pubsub.into_on_message());
            while let Some(msg) = messages.next().await {
                match decode_envelope(msg.get_payload_bytes()) {
                    Ok((sequence_id, batch)) => {
                        relay_sequence.fetch_max(sequence_id, Ordering::SeqCst);
                        relay_events.received(sequence_id, batch);
                    }
                    Err(e) => {
                        warn!(stream = stream_index, error = %e, "Dropping undecodable envelope");
                    }
                }
            }
            relay_events.failed(AdapterError::Connection(
                "Redis pub/sub connection closed".to_string(),
            ));
        });

        self.relays.lock().insert(
            stream_index,
            Relay {
                task,
                last_sequence,
            },
        );

        info!(
            stream = stream_index,
            channel = %channel,
            last_sequence = current,
            "Redis relay subscribed"
        );
        if reopened {
            events.restored();
        }
        Ok(())
    }

    async fn send(&self, stream_index: usize, messages: &[Message]) -> Result<()> {
        let payload = encode_payload(messages)?;
        let mut conn = self.conn.clone();

        let sequence_id: i64 = self
            .script
            .key(self.counter_key(stream_index))
            .key(self.channel(stream_index))
            .arg(payload.as_ref())
            .invoke_async(&mut conn)
            .await?;

        debug!(stream = stream_index, sequence_id, "Batch relayed via Redis");
        Ok(())
    }

    async fn close(&self, stream_index: usize) {
        if self.stop_relay(stream_index).is_some() {
            debug!(stream = stream_index, "Redis relay closed");
        }
    }
}

impl Drop for RedisBackingStore {
    fn drop(&mut self) {
        for relay in self.relays.lock().values() {
            relay.task.abort();
        }
    }
}

