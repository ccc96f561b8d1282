//! Frames: the atomic unit exchanged between the tunnel core and the transport.

use std::sync::Arc;

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Flag bits carried next to a frame on the link.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// Final frame of a direction.
        const CLOSE = 0b0000_0001;
        /// Resend request: the sequence field carries the receiver's ack.
        const RESEND = 0b0000_0010;
    }
}

// ── Frame ─────────────────────────────────────────────────────────

/// One sequenced chunk of a tunnel direction.
///
/// For a fixed tunnel and direction, a given `sequence` always carries the
/// same payload: retransmissions are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tunnel_id: u64,
    /// Zero-based, contiguous per direction.
    pub sequence: u64,
    pub payload: Bytes,
    /// Marks the last frame of this direction.
    pub is_close: bool,
}

impl Frame {
    /// A data frame.
    pub fn data(tunnel_id: u64, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            tunnel_id,
            sequence,
            payload: payload.into(),
            is_close: false,
        }
    }

    /// A graceful end-of-stream frame with an empty payload.
    pub fn close(tunnel_id: u64, sequence: u64) -> Self {
        Self {
            tunnel_id,
            sequence,
            payload: Bytes::new(),
            is_close: true,
        }
    }

    /// An empty, non-close frame. It only advances the sequence.
    pub fn keepalive(tunnel_id: u64, sequence: u64) -> Self {
        Self::data(tunnel_id, sequence, Bytes::new())
    }

    pub fn flags(&self) -> FrameFlags {
        if self.is_close {
            FrameFlags::CLOSE
        } else {
            FrameFlags::empty()
        }
    }
}

// ── Message ───────────────────────────────────────────────────────

/// Everything the core hands to, or accepts from, a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Stream data (or the end of it).
    Data(Frame),
    /// The receiver is stuck waiting for `ack` on `tunnel_id` and asks the
    /// sender to retransmit from there.
    Resend { tunnel_id: u64, ack: u64 },
}

impl Message {
    pub fn tunnel_id(&self) -> u64 {
        match self {
            Message::Data(frame) => frame.tunnel_id,
            Message::Resend { tunnel_id, .. } => *tunnel_id,
        }
    }
}

impl From<Frame> for Message {
    fn from(frame: Frame) -> Self {
        Message::Data(frame)
    }
}

/// A message produced by a tunnel, tagged with the session it belongs to
/// so a transport serving several peers can route it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub peer_session_id: Arc<str>,
    pub message: Message,
}
