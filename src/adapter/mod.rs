//! Backing stores: how a stream's batches reach other processes.
//!
//! This module contains:
//! - `BackingStore` trait: relay contract every technology implements
//! - `AdapterEvents`: the channel a store uses to report received batches,
//!   failures and restorations back to its stream
//! - Backing store configuration and the startup factory
//! - Implementations: in-process loop-back, Redis, mock (tests)
//!
//! A store is handed each stream's outgoing messages through `send`. It owns
//! sequence assignment: once a batch is durably relayed it must come back
//! through [`AdapterEvents::received`] on every process (the sender included)
//! with an id that is strictly greater than the previous one for that stream.
//! The stream applies receipts in the order the store reports them and never
//! reorders them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::codec::CodecError;
use crate::message::Message;
use crate::stream::StreamEvent;

pub mod in_process;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_process::InProcessBackingStore;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockBackingStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisBackingStore;

// ============================================================================
// Traits
// ============================================================================

/// Result type for backing store operations.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors raised by backing stores.
///
/// All of these are transient from the stream's point of view: the stream
/// moves to `Buffering` and retries per its reconnect schedule.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Stream {0} is not open on this backing store")]
    NotOpen(usize),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Backing store '{0}' is not available in this build")]
    Unsupported(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Relay contract implemented once per backing technology.
///
/// The bus treats every store identically; swapping stores changes durability
/// and fan-out reach, never the ordering contract.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Establish (or re-establish) the relay for one stream.
    ///
    /// Called again after every failure. Implementations must restore the
    /// last known sequence id for the stream before returning so that a
    /// reconnect never surfaces as a silent gap.
    async fn open(&self, stream_index: usize, events: AdapterEvents) -> Result<()>;

    /// Relay one batch of messages for a stream.
    ///
    /// Returning `Ok` means the store accepted the batch; the sequenced batch
    /// arrives later through `events.received`.
    async fn send(&self, stream_index: usize, messages: &[Message]) -> Result<()>;

    /// Switch to an alternative notification mechanism once the reconnect
    /// schedule is exhausted. `Ok(true)` keeps the stream alive.
    async fn fall_back(&self, stream_index: usize, events: AdapterEvents) -> Result<bool> {
        let _ = (stream_index, events);
        Ok(false)
    }

    /// Release resources held for a stream.
    async fn close(&self, stream_index: usize) {
        let _ = stream_index;
    }
}

/// Callback surface a backing store uses to talk back to its stream.
///
/// Every method enqueues and returns immediately; the stream processes events
/// on its own task in the order they were fired.
#[derive(Clone)]
pub struct AdapterEvents {
    stream_index: usize,
    sender: mpsc::UnboundedSender<StreamEvent>,
}

impl AdapterEvents {
    pub(crate) fn new(stream_index: usize, sender: mpsc::UnboundedSender<StreamEvent>) -> Self {
        Self {
            stream_index,
            sender,
        }
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    /// A batch with `sequence_id` is ready to become visible.
    pub fn received(&self, sequence_id: u64, messages: Vec<Message>) {
        self.emit(StreamEvent::Received {
            sequence_id,
            messages,
        });
    }

    /// The relay connection broke.
    pub fn failed(&self, error: AdapterError) {
        self.emit(StreamEvent::Failed(error));
    }

    /// The relay connection recovered on its own.
    pub fn restored(&self) {
        self.emit(StreamEvent::Restored);
    }

    /// Whether the owning stream is still listening.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn emit(&self, event: StreamEvent) {
        if self.sender.send(event).is_err() {
            debug!(stream = self.stream_index, "Stream gone, dropping adapter event");
        }
    }
}

impl std::fmt::Debug for AdapterEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterEvents")
            .field("stream_index", &self.stream_index)
            .finish()
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Backing store type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingStoreType {
    /// Single-process loop-back relay.
    #[default]
    InProcess,
    /// Redis INCR + PUBLISH relay.
    Redis,
}

/// Backing store configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Backing store type discriminator.
    #[serde(rename = "type")]
    pub store_type: BackingStoreType,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix for stream counter keys and channels.
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "scaleout".to_string(),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the backing store selected by configuration.
///
/// Requires the corresponding feature to be enabled:
/// - In-process: always available
/// - Redis: `--features redis`
pub async fn init_backing_store(config: &AdapterConfig) -> Result<Arc<dyn BackingStore>> {
    match config.store_type {
        BackingStoreType::InProcess => {
            info!(backing_store = "in_process", "Backing store initialized");
            Ok(Arc::new(InProcessBackingStore::new()))
        }
        BackingStoreType::Redis => {
            #[cfg(feature = "redis")]
            {
                let store = RedisBackingStore::connect(&config.redis).await?;
                info!(backing_store = "redis", url = %config.redis.url, "Backing store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(AdapterError::Unsupported(
                    "redis (rebuild with --features redis)".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_config_default() {
        let config = AdapterConfig::default();
        assert_eq!(config.store_type, BackingStoreType::InProcess);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.redis.key_prefix, "scaleout");
    }

    #[tokio::test]
    async fn test_factory_builds_in_process_store() {
        let store = init_backing_store(&AdapterConfig::default()).await.unwrap();
        assert_eq!(store.name(), "in_process");
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_factory_rejects_redis_without_feature() {
        let config = AdapterConfig {
            store_type: BackingStoreType::Redis,
            ..Default::default()
        };
        assert!(matches!(
            init_backing_store(&config).await,
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_events_after_stream_dropped_are_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = AdapterEvents::new(3, tx);
        drop(rx);

        assert!(events.is_closed());
        events.received(1, vec![Message::new("k", "v")]);
        events.restored();
    }
}
