//! Lock-free counters published by a tunnel's pumps, and the snapshot
//! monitoring code reads from them.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::reorder::ReorderBuffer;

/// Where a tunnel is in its teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelPhase {
    /// Pumping in both directions.
    Open,
    /// Terminal; the pumps are still releasing the sources and the sink.
    Closing,
    /// Terminal, and every source and the sink have been released.
    Closed,
}

impl TunnelPhase {
    pub(crate) fn of(terminal: bool, released: bool) -> Self {
        match (terminal, released) {
            (false, _) => Self::Open,
            (true, false) => Self::Closing,
            (true, true) => Self::Closed,
        }
    }
}

impl std::fmt::Display for TunnelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Point-in-time view of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelStats {
    pub id: u64,
    pub peer_session_id: String,
    /// Next sequence number the read-pump will stamp.
    pub write_sequence: u64,
    /// Next inbound sequence number the reorder buffer will release.
    pub next_expected: u64,
    /// Highest inbound sequence released to the sink so far.
    pub read_sequence: Option<u64>,
    /// Out-of-order bytes held by the reorder buffer.
    pub buffered_bytes: usize,
    pub pending_frames: usize,
    /// Released bytes not yet written to the sink.
    pub sink_backlog: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub source_errors: u64,
    pub phase: TunnelPhase,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub write_sequence: AtomicU64,
    pub next_expected: AtomicU64,
    pub buffered_bytes: AtomicUsize,
    pub pending_frames: AtomicUsize,
    pub sink_backlog: AtomicUsize,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub duplicates: AtomicU64,
    pub rejected: AtomicU64,
    pub source_errors: AtomicU64,
}

impl Counters {
    /// Mirror the reorder buffer's state. Called with its lock held.
    pub fn publish(&self, reorder: &ReorderBuffer) {
        self.next_expected
            .store(reorder.next_expected(), Ordering::Relaxed);
        self.buffered_bytes
            .store(reorder.buffered_bytes(), Ordering::Relaxed);
        self.pending_frames
            .store(reorder.pending_frames(), Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, id: u64, peer_session_id: &str, phase: TunnelPhase) -> TunnelStats {
        let next_expected = self.next_expected.load(Ordering::Relaxed);
        TunnelStats {
            id,
            peer_session_id: peer_session_id.to_string(),
            write_sequence: self.write_sequence.load(Ordering::Relaxed),
            next_expected,
            read_sequence: next_expected.checked_sub(1),
            buffered_bytes: self.buffered_bytes.load(Ordering::Relaxed),
            pending_frames: self.pending_frames.load(Ordering::Relaxed),
            sink_backlog: self.sink_backlog.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            phase,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn phase_follows_teardown() {
        assert_eq!(TunnelPhase::of(false, false), TunnelPhase::Open);
        assert_eq!(TunnelPhase::of(true, false), TunnelPhase::Closing);
        assert_eq!(TunnelPhase::of(true, true), TunnelPhase::Closed);
        assert_eq!(TunnelPhase::Closing.to_string(), "Closing");
    }

    #[test]
    fn snapshot_mirrors_reorder_state() {
        let c = Counters::default();
        let mut reorder = ReorderBuffer::new(64);
        reorder.offer(0, Bytes::from_static(b"a"), false).unwrap();
        reorder.offer(2, Bytes::from_static(b"ccc"), false).unwrap();
        c.publish(&reorder);

        let s = c.snapshot(3, "session-a", TunnelPhase::Open);
        assert_eq!(s.id, 3);
        assert_eq!(s.next_expected, 1);
        assert_eq!(s.read_sequence, Some(0));
        assert_eq!(s.buffered_bytes, 3);
        assert_eq!(s.pending_frames, 1);
        assert_eq!(s.phase, TunnelPhase::Open);
    }

    #[test]
    fn fresh_snapshot_has_no_read_sequence() {
        let s = Counters::default().snapshot(1, "s", TunnelPhase::Open);
        assert_eq!(s.read_sequence, None);
        assert_eq!(s.write_sequence, 0);
    }
}
