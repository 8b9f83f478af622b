//! Fragment reassembler
//!
//! Turns out-of-order, at-most-once fragment delivery into an in-order stream.
//! Sequences start at 0 and increase by exactly 1 per fragment.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use tracing::{debug, warn};

/// A fragment released in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    /// `None` for unordered legacy fragments
    pub sequence: Option<u64>,
    pub content: String,
}

/// Outcome of one ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Fragments now deliverable, in order
    Released(Vec<Released>),
    /// Ahead of the next expected sequence; held back
    Buffered,
    /// Already released or already buffered; dropped
    Duplicate,
}

/// Per-stream reassembly buffer
#[derive(Debug)]
pub struct Reassembler {
    stream_id: String,
    next_expected: u64,
    pending: BTreeMap<u64, String>,
    delivered_length: u64,
    max_seen: Option<u64>,
    sealed: bool,
}

impl Reassembler {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            next_expected: 0,
            pending: BTreeMap::new(),
            delivered_length: 0,
            max_seen: None,
            sealed: false,
        }
    }

    /// Accept one fragment
    pub fn ingest(&mut self, sequence: Option<u64>, content: String) -> Ingest {
        if self.sealed && sequence.is_none_or(|s| s < self.next_expected) {
            warn!(stream_id = %self.stream_id, ?sequence, "Dropping fragment already covered by compensation");
            return Ingest::Duplicate;
        }

        let Some(sequence) = sequence else {
            debug!(stream_id = %self.stream_id, "Reassembler::ingest: unordered fragment");
            self.delivered_length += char_len(&content);
            return Ingest::Released(vec![Released { sequence: None, content }]);
        };

        self.max_seen = Some(self.max_seen.map_or(sequence, |m| m.max(sequence)));

        if sequence < self.next_expected {
            warn!(stream_id = %self.stream_id, sequence, next_expected = self.next_expected, "Dropping duplicate fragment");
            return Ingest::Duplicate;
        }

        if sequence > self.next_expected {
            return match self.pending.entry(sequence) {
                Entry::Vacant(slot) => {
                    debug!(stream_id = %self.stream_id, sequence, next_expected = self.next_expected, "Reassembler::ingest: buffering");
                    slot.insert(content);
                    Ingest::Buffered
                }
                Entry::Occupied(_) => {
                    warn!(stream_id = %self.stream_id, sequence, "Dropping duplicate buffered fragment");
                    Ingest::Duplicate
                }
            };
        }

        let mut released = vec![self.release(sequence, content)];
        while let Some(next) = self.pending.remove(&self.next_expected) {
            debug!(stream_id = %self.stream_id, sequence = self.next_expected, "Reassembler::ingest: flushing buffered");
            released.push(self.release(self.next_expected, next));
        }
        Ingest::Released(released)
    }

    fn release(&mut self, sequence: u64, content: String) -> Released {
        self.next_expected = sequence + 1;
        self.delivered_length += char_len(&content);
        Released {
            sequence: Some(sequence),
            content,
        }
    }

    /// Account for content delivered outside the ordered path (compensation)
    pub fn note_delivered(&mut self, content: &str) {
        self.delivered_length += char_len(content);
    }

    /// Treat every sequence below `through` as delivered
    ///
    /// Called once the remaining content went out in a single compensating
    /// fragment. Buffered fragments in that range are dropped and returned;
    /// later arrivals in the range, and unordered fragments, become duplicates.
    pub fn seal(&mut self, through: u64) -> Vec<u64> {
        debug!(stream_id = %self.stream_id, through, "Reassembler::seal: called");
        self.sealed = true;
        self.next_expected = self.next_expected.max(through);
        let kept = self.pending.split_off(&self.next_expected);
        std::mem::replace(&mut self.pending, kept).into_keys().collect()
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Characters released so far
    pub fn delivered_length(&self) -> u64 {
        self.delivered_length
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Highest sequence number ever ingested
    pub fn max_sequence_seen(&self) -> Option<u64> {
        self.max_seen
    }

    /// Drop everything still buffered, returning the abandoned sequences
    pub fn release_buffered(&mut self) -> Vec<u64> {
        let abandoned: Vec<u64> = self.pending.keys().copied().collect();
        self.pending.clear();
        abandoned
    }
}

pub(crate) fn char_len(s: &str) -> u64 {
    s.chars().count() as u64
}
