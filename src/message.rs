//! Message and batch types.
//!
//! A [`Message`] is the immutable payload unit published to the bus. Messages
//! travel in a [`MessageBatch`], which is the unit of relay: the owning stream
//! stamps the batch with a sequence id once its backing store has accepted it.

use bytes::Bytes;

/// A keyed payload.
///
/// `key` names the logical topic (a connection id, a group name, ...).
/// Command messages carry control data (for example group-membership changes)
/// that consumers apply before handing ordinary values to their own clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    key: String,
    value: Bytes,
    is_command: bool,
}

impl Message {
    /// Create an ordinary value message.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_command: false,
        }
    }

    /// Create a command (control) message.
    pub fn command(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_command: true,
        }
    }

    /// Create a message with an explicit command flag.
    pub fn with_flag(key: impl Into<String>, value: impl Into<Bytes>, is_command: bool) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            is_command,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn is_command(&self) -> bool {
        self.is_command
    }
}

/// An ordered group of messages as made visible by one stream.
///
/// `sequence_id` is strictly increasing within a stream's lifetime. Gaps are
/// legal; repeats and decreases are not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    stream_index: usize,
    sequence_id: u64,
    messages: Vec<Message>,
}

impl MessageBatch {
    pub fn new(stream_index: usize, sequence_id: u64, messages: Vec<Message>) -> Self {
        Self {
            stream_index,
            sequence_id,
            messages,
        }
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// `(stream_index, sequence_id)`, the ordering key for replay.
    pub fn position(&self) -> (usize, u64) {
        (self.stream_index, self.sequence_id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Distinct keys referenced by this batch, in first-appearance order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            if !keys.contains(&message.key()) {
                keys.push(message.key());
            }
        }
        keys
    }

    /// Whether any message in the batch targets `key`.
    pub fn touches(&self, key: &str) -> bool {
        self.messages.iter().any(|m| m.key() == key)
    }
}
