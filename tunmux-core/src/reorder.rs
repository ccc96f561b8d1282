//! Reorder buffer: turns out-of-order, possibly duplicated frames into an
//! in-order byte stream with at-most-once release.
//!
//! ```text
//!            next_expected
//!                 │
//!   released ◄────┤   pending (out of order)
//!   0 1 2 3       4   [6] [7]     [9]
//! ```
//!
//! `offer` never blocks. A frame is released immediately, held until the gap
//! in front of it closes, dropped as a duplicate, or rejected because holding
//! it would exceed `capacity_bytes`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::TunnelError;

/// In-order bytes produced by one `offer` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Release {
    /// Payload chunks in sequence order. Empty payloads are not included.
    pub chunks: Vec<Bytes>,
    /// The close frame was released; the direction is finished.
    pub finished: bool,
}

impl Release {
    pub fn byte_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

/// Result of offering one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// The frame was at `next_expected`; it and any buffered successors were released.
    Released(Release),
    /// The frame is ahead of `next_expected` and is held until the gap closes.
    Buffered,
    /// The sequence was already released or is already held.
    Duplicate,
    /// The direction already ended; late frames are discarded.
    AfterClose,
}

#[derive(Debug)]
struct Held {
    payload: Bytes,
    is_close: bool,
}

#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: u64,
    pending: BTreeMap<u64, Held>,
    buffered_bytes: usize,
    capacity_bytes: usize,
    finished: bool,
    /// Set while `pending` is non-empty: when the current gap was last
    /// observed without progress.
    gap_since: Option<Instant>,
}

impl ReorderBuffer {
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            buffered_bytes: 0,
            capacity_bytes,
            finished: false,
            gap_since: None,
        }
    }

    /// Offer one frame.
    ///
    /// Fails with [`TunnelError::GapOverflow`] when an out-of-order frame
    /// would push the held bytes above capacity. The frame is dropped and
    /// `next_expected` is untouched; the peer is expected to retransmit.
    pub fn offer(
        &mut self,
        sequence: u64,
        payload: Bytes,
        is_close: bool,
    ) -> Result<Offer, TunnelError> {
        if self.finished {
            return Ok(Offer::AfterClose);
        }
        if sequence < self.next_expected {
            return Ok(Offer::Duplicate);
        }

        if sequence > self.next_expected {
            if self.pending.contains_key(&sequence) {
                return Ok(Offer::Duplicate);
            }
            let buffered = self.buffered_bytes + payload.len();
            if buffered > self.capacity_bytes {
                return Err(TunnelError::GapOverflow {
                    sequence,
                    buffered: self.buffered_bytes,
                    capacity: self.capacity_bytes,
                });
            }
            self.buffered_bytes = buffered;
            self.pending.insert(sequence, Held { payload, is_close });
            self.gap_since.get_or_insert_with(Instant::now);
            return Ok(Offer::Buffered);
        }

        let mut release = Release::default();
        self.release_one(payload, is_close, &mut release);
        while !release.finished {
            let Some(held) = self.pending.remove(&self.next_expected) else {
                break;
            };
            self.buffered_bytes -= held.payload.len();
            self.release_one(held.payload, held.is_close, &mut release);
        }

        if release.finished {
            // Anything held past the close frame can never be released.
            self.pending.clear();
            self.buffered_bytes = 0;
        }
        self.gap_since = if self.pending.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Ok(Offer::Released(release))
    }

    fn release_one(&mut self, payload: Bytes, is_close: bool, release: &mut Release) {
        if !payload.is_empty() {
            release.chunks.push(payload);
        }
        self.next_expected += 1;
        if is_close {
            self.finished = true;
            release.finished = true;
        }
    }

    /// The sequence number that must be released next.
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// The highest sequence released so far.
    pub fn read_sequence(&self) -> Option<u64> {
        self.next_expected.checked_sub(1)
    }

    /// Payload bytes held out of order.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// The close frame was released.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// How long the current gap has stayed open without progress.
    pub fn gap_age(&self, now: Instant) -> Option<Duration> {
        self.gap_since.map(|since| now.saturating_duration_since(since))
    }
}
