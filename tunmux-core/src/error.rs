//! Domain-specific error types for the tunnel core.
//!
//! Fallible operations return `Result<T, TunnelError>`. Outcomes that are
//! expected during normal operation (a duplicate frame, a frame for a tunnel
//! that was already torn down) are reported as values, not errors.

use thiserror::Error;

/// The canonical error type for the tunnel core.
#[derive(Debug, Error)]
pub enum TunnelError {
    // ── Registry Errors ──────────────────────────────────────────
    /// A live tunnel already owns this identifier.
    #[error("tunnel id {0} is already registered")]
    DuplicateId(u64),

    /// The peer session was torn down; it cannot own new tunnels.
    #[error("peer session {0:?} is closed")]
    SessionClosed(String),

    /// A tunnel needs at least one readable source.
    #[error("tunnel has no sources")]
    NoSources,

    // ── Stream Errors ────────────────────────────────────────────
    /// Buffering an out-of-order frame would exceed the reorder capacity.
    #[error("sequence gap overflow at seq {sequence}: {buffered} bytes buffered (capacity {capacity})")]
    GapOverflow {
        sequence: u64,
        buffered: usize,
        capacity: usize,
    },

    /// Released bytes are piling up in front of a slow sink.
    #[error("sink backlog of {queued} bytes exceeds capacity {capacity}")]
    SinkBacklog { queued: usize, capacity: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The IO layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // ── Codec Errors ─────────────────────────────────────────────
    /// Received bytes that do not start with the link magic.
    #[error("invalid magic bytes: expected TMX0")]
    InvalidMagic,

    /// The payload failed checksum verification.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Frame size exceeded the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The flag byte carries bits this version does not understand.
    #[error("unknown frame flags: {0:#04x}")]
    UnknownFlags(u8),

    // ── Configuration Errors ─────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for TunnelError {
    fn from(s: String) -> Self {
        TunnelError::Other(s)
    }
}

impl From<&str> for TunnelError {
    fn from(s: &str) -> Self {
        TunnelError::Other(s.to_string())
    }
}
