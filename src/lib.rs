//! Scaleout - sequenced fan-out message bus
//!
//! Publishers write keyed messages; subscribers register interest in keys
//! and receive every batch touching them, in order, from a resumable cursor.
//! Messages are partitioned across a fixed number of streams, and each
//! stream is relayed through a pluggable backing store so that several
//! processes sharing the store see the same sequence.

pub mod adapter;
pub mod bus;
pub mod codec;
pub mod config;
pub mod cursor;
pub mod message;
pub mod stream;
pub mod subscription;
pub mod topic;
pub mod utils;

pub use adapter::{init_backing_store, AdapterConfig, AdapterError, BackingStore};
pub use bus::{BusError, MessageBus, StatsSnapshot};
pub use config::{BusConfig, Config, ConfigError};
pub use cursor::{Cursor, CursorError};
pub use message::{Message, MessageBatch};
pub use stream::StreamState;
pub use subscription::{
    Delivery, DeliveryHandler, DeliveryOutcome, Projection, SubscriberError, SubscriptionHandle,
    SubscriptionId,
};
