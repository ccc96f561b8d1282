//! Per-tunnel tuning shared by every tunnel a `Dispatcher` creates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Tunnel tuning knobs, loadable from a TOML section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Maximum payload bytes read from a source into one outbound frame.
    pub chunk_size: usize,
    /// Bound on out-of-order bytes held by the reorder buffer, and on
    /// released bytes still waiting for the sink.
    pub capacity_bytes: usize,
    /// Tear a tunnel down when a sequence gap stays open this long (0 = never).
    pub gap_timeout_ms: u64,
    /// Pending out-of-order frames that trigger a resend request.
    pub resend_threshold: usize,
    /// Depth of the dispatcher's outbound queue.
    pub outbound_queue: usize,
    /// How long a torn-down peer session refuses new tunnels.
    pub session_retire_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            capacity_bytes: 4 * 1024 * 1024,
            gap_timeout_ms: 60_000,
            resend_threshold: 3,
            outbound_queue: 256,
            session_retire_ms: 30_000,
        }
    }
}

impl TunnelConfig {
    /// Reject values that would stall or break every tunnel.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.chunk_size == 0 {
            return Err(TunnelError::Config("chunk_size must be non-zero".into()));
        }
        if self.chunk_size > crate::codec::MAX_PAYLOAD_SIZE {
            return Err(TunnelError::Config(format!(
                "chunk_size {} exceeds the link payload limit {}",
                self.chunk_size,
                crate::codec::MAX_PAYLOAD_SIZE
            )));
        }
        if self.capacity_bytes == 0 {
            return Err(TunnelError::Config("capacity_bytes must be non-zero".into()));
        }
        if self.outbound_queue == 0 {
            return Err(TunnelError::Config("outbound_queue must be non-zero".into()));
        }
        if self.session_retire_ms == 0 {
            return Err(TunnelError::Config("session_retire_ms must be non-zero".into()));
        }
        Ok(())
    }

    /// The gap inactivity timeout, or `None` when disabled.
    pub fn gap_timeout(&self) -> Option<Duration> {
        match self.gap_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn session_retirement(&self) -> Duration {
        Duration::from_millis(self.session_retire_ms)
    }
}
