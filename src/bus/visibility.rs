//! Per-stream visibility watermarks.
//!
//! A batch that touches several keys is appended to each key's topic in
//! turn. Until the last append finishes, a subscriber on two of those keys
//! could see the batch in one topic but not the other. The watermark for a
//! stream only moves once every append for a sequence id is done, and pulls
//! ignore anything above it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::cursor::Cursor;

/// Highest fully applied sequence id per stream.
#[derive(Debug)]
pub struct Visibility {
    applied: Vec<AtomicU64>,
}

impl Visibility {
    pub fn new(stream_count: usize) -> Self {
        Self {
            applied: (0..stream_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.applied.len()
    }

    /// Publish `sequence_id` as fully applied on `stream_index`.
    ///
    /// Only ever moves forward; out-of-range streams are ignored.
    pub(crate) fn mark(&self, stream_index: usize, sequence_id: u64) {
        if let Some(slot) = self.applied.get(stream_index) {
            slot.fetch_max(sequence_id, Ordering::Release);
        }
    }

    /// Highest applied sequence id on a stream (0 before any).
    pub fn applied(&self, stream_index: usize) -> u64 {
        self.applied
            .get(stream_index)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Watermarks for every stream, indexed by stream.
    pub fn snapshot(&self) -> Vec<u64> {
        self.applied
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .collect()
    }

    /// Cursor positioned at the current watermarks ("from now on").
    pub fn cursor(&self) -> Cursor {
        Cursor::from_positions(self.snapshot().into_iter().enumerate())
    }
}
