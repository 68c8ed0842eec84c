//! Subscriber resume positions.
//!
//! A [`Cursor`] records, per stream, the last sequence id a subscriber has
//! seen. It is the only subscriber state that leaves the process, so its
//! string form is stable: entries are `"<stream_index>,<sequence_id_hex>"`
//! joined by `|`, for example `0,1f|1,0|3,a2`.
//!
//! Streams without an entry sit at sequence 0, which replays everything
//! still retained for that stream.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Separator between stream entries.
const ENTRY_SEPARATOR: char = '|';
/// Separator between stream index and sequence id within an entry.
const FIELD_SEPARATOR: char = ',';

/// Errors produced when parsing a cursor string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("Empty cursor entry at position {0}")]
    EmptyEntry(usize),

    #[error("Cursor entry '{0}' is missing the ',' separator")]
    MissingSeparator(String),

    #[error("Invalid stream index in cursor entry '{0}'")]
    InvalidStreamIndex(String),

    #[error("Invalid sequence id in cursor entry '{0}'")]
    InvalidSequence(String),

    #[error("Stream {0} appears more than once in cursor")]
    DuplicateStream(usize),
}

/// Per-stream resume position.
///
/// Cursors are only comparable per stream; there is no total order across
/// streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    positions: BTreeMap<usize, u64>,
}

impl Cursor {
    /// Create an empty cursor (full replay on every stream).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cursor from explicit `(stream_index, sequence_id)` entries.
    pub fn from_positions(positions: impl IntoIterator<Item = (usize, u64)>) -> Self {
        Self {
            positions: positions.into_iter().collect(),
        }
    }

    /// Last seen sequence id on `stream_index` (0 when absent).
    pub fn position(&self, stream_index: usize) -> u64 {
        self.positions.get(&stream_index).copied().unwrap_or(0)
    }

    /// Set the position for a stream unconditionally.
    pub fn set(&mut self, stream_index: usize, sequence_id: u64) {
        self.positions.insert(stream_index, sequence_id);
    }

    /// Move a stream's position forward. Lower values are ignored.
    pub fn advance(&mut self, stream_index: usize, sequence_id: u64) {
        let entry = self.positions.entry(stream_index).or_insert(0);
        if sequence_id > *entry {
            *entry = sequence_id;
        }
    }

    /// Iterate `(stream_index, sequence_id)` entries in stream order.
    pub fn entries(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.positions.iter().map(|(s, q)| (*s, *q))
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Fit the cursor to a bus with `stream_count` streams.
    ///
    /// Entries for streams that do not exist are dropped; missing streams are
    /// filled in at sequence 0.
    pub fn fit_to(&self, stream_count: usize) -> Self {
        Self {
            positions: (0..stream_count).map(|s| (s, self.position(s))).collect(),
        }
    }

    /// Parse the `"<stream>,<hex>|..."` form.
    pub fn parse(input: &str) -> Result<Self, CursorError> {
        let mut positions = BTreeMap::new();
        if input.is_empty() {
            return Ok(Self { positions });
        }

        for (i, entry) in input.split(ENTRY_SEPARATOR).enumerate() {
            if entry.is_empty() {
                return Err(CursorError::EmptyEntry(i));
            }
            let (stream, sequence) = entry
                .split_once(FIELD_SEPARATOR)
                .ok_or_else(|| CursorError::MissingSeparator(entry.to_string()))?;

            // from_str_radix tolerates a leading '+', the wire format does not
            if stream.is_empty() || !stream.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CursorError::InvalidStreamIndex(entry.to_string()));
            }
            let stream: usize = stream
                .parse()
                .map_err(|_| CursorError::InvalidStreamIndex(entry.to_string()))?;

            if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(CursorError::InvalidSequence(entry.to_string()));
            }
            let sequence = u64::from_str_radix(sequence, 16)
                .map_err(|_| CursorError::InvalidSequence(entry.to_string()))?;

            if positions.insert(stream, sequence).is_some() {
                return Err(CursorError::DuplicateStream(stream));
            }
        }

        Ok(Self { positions })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (stream, sequence)) in self.positions.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", ENTRY_SEPARATOR)?;
            }
            write!(f, "{}{}{:x}", stream, FIELD_SEPARATOR, sequence)?;
        }
        Ok(())
    }
}

impl FromStr for Cursor {
    type Err = CursorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
