//! A tunnel: one duplex, sequenced byte stream multiplexed within a peer
//! session.
//!
//! Each tunnel runs as a small set of single-owner tasks:
//!
//! ```text
//!   sources ──► read-pump ──(owns write_sequence)──► outbound channel ──► transport
//!
//!   transport ──► Tunnel::offer ──(ReorderBuffer)──► sink writer ──► sink
//!                                                   (owns the sink)
//!   gap watchdog ── closes the tunnel when a gap outlives gap_timeout
//! ```
//!
//! The reorder buffer sits behind a mutex scoped to this tunnel alone and is
//! only held for the synchronous `offer`, so one congested tunnel never
//! stalls another. Every teardown path converges on [`Tunnel::close`]: a
//! close frame from the peer, the local sources ending, a sink failure, a
//! stuck gap or an explicit close all end the whole tunnel.

mod pump;
mod stats;

pub use stats::{TunnelPhase, TunnelStats};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::frame::{Frame, Message, Outbound};
use crate::reorder::{Offer, ReorderBuffer};
use stats::Counters;

/// A local readable source fanned into the outbound sequence
/// (a process's stdout, a forwarded socket's read half, ...).
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

/// The single destination for in-order inbound bytes.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to a live tunnel, as handed to the control plane.
pub type TunnelHandle = Arc<Tunnel>;

// ── CloseReason ──────────────────────────────────────────────────

/// Why a tunnel became terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit close or registry removal on this side.
    Local,
    /// The peer's close frame was released and the sink shut down.
    PeerClosed,
    /// Every local source reached end of stream; the close frame went out.
    SourcesEnded,
    /// Teardown of the whole peer session.
    SessionEnded,
    /// Writing to the sink failed.
    SinkFailed,
    /// A sequence gap stayed open past the inactivity timeout.
    GapTimeout,
    /// The outbound channel to the transport is gone.
    TransportGone,
}

impl CloseReason {
    /// Whether the peer still needs a close frame from us. It already knows
    /// when it closed first, when our sources ended, or when nothing is left
    /// to carry the frame.
    pub fn notifies_peer(self) -> bool {
        matches!(self, Self::Local | Self::SinkFailed | Self::GapTimeout)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::PeerClosed => write!(f, "closed by peer"),
            Self::SourcesEnded => write!(f, "sources ended"),
            Self::SessionEnded => write!(f, "session ended"),
            Self::SinkFailed => write!(f, "sink write failed"),
            Self::GapTimeout => write!(f, "sequence gap timed out"),
            Self::TransportGone => write!(f, "transport gone"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum SinkCommand {
    Write(Bytes),
    Finish,
}

// ── Tunnel ───────────────────────────────────────────────────────

pub struct Tunnel {
    id: u64,
    peer_session_id: Arc<str>,
    reorder: Mutex<ReorderBuffer>,
    sink_tx: mpsc::UnboundedSender<SinkCommand>,
    outbound: mpsc::Sender<Outbound>,
    counters: Counters,
    capacity_bytes: usize,
    resend_threshold: usize,
    last_resend_ack: AtomicU64,
    reason: OnceLock<CloseReason>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Tunnel {
    /// Build a tunnel and start its pumps on the current runtime.
    ///
    /// The tunnel is not registered anywhere; see [`crate::Registry::create`].
    pub fn spawn(
        id: u64,
        peer_session_id: Arc<str>,
        sink: Sink,
        sources: Vec<Source>,
        config: &TunnelConfig,
        outbound: mpsc::Sender<Outbound>,
    ) -> Arc<Self> {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let tunnel = Arc::new(Self {
            id,
            peer_session_id,
            reorder: Mutex::new(ReorderBuffer::new(config.capacity_bytes)),
            sink_tx,
            outbound,
            counters: Counters::default(),
            capacity_bytes: config.capacity_bytes,
            resend_threshold: config.resend_threshold,
            last_resend_ack: AtomicU64::new(u64::MAX),
            reason: OnceLock::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        tunnel.tasks.spawn(pump::read_pump(
            Arc::clone(&tunnel),
            sources,
            config.chunk_size,
        ));
        tunnel
            .tasks
            .spawn(pump::sink_writer(Arc::clone(&tunnel), sink, sink_rx));
        if let Some(timeout) = config.gap_timeout() {
            tunnel
                .tasks
                .spawn(pump::gap_watchdog(Arc::clone(&tunnel), timeout));
        }
        tunnel.tasks.close();

        debug!(tunnel = id, session = %tunnel.peer_session_id, "tunnel started");
        tunnel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_session_id(&self) -> &str {
        &self.peer_session_id
    }

    // ── Inbound path ─────────────────────────────────────────────

    /// Offer one inbound frame. Never blocks.
    ///
    /// Released bytes are queued to the sink writer in release order while
    /// the reorder lock is still held, so concurrent callers cannot
    /// interleave them.
    pub fn offer(&self, frame: Frame) -> Result<Offer, TunnelError> {
        if self.is_closed() {
            Counters::bump(&self.counters.duplicates);
            return Ok(Offer::AfterClose);
        }

        let mut reorder = self.lock_reorder();
        if frame.sequence >= reorder.next_expected() && !reorder.is_finished() {
            let queued = self.counters.sink_backlog.load(Ordering::Relaxed);
            if queued > self.capacity_bytes {
                Counters::bump(&self.counters.rejected);
                return Err(TunnelError::SinkBacklog {
                    queued,
                    capacity: self.capacity_bytes,
                });
            }
        }

        let result = reorder.offer(frame.sequence, frame.payload, frame.is_close);
        self.counters.publish(&reorder);
        match &result {
            Ok(Offer::Released(release)) => {
                for chunk in &release.chunks {
                    let len = chunk.len();
                    self.counters.sink_backlog.fetch_add(len, Ordering::Relaxed);
                    self.counters
                        .bytes_in
                        .fetch_add(len as u64, Ordering::Relaxed);
                    // The writer only goes away once the tunnel is closed.
                    let _ = self.sink_tx.send(SinkCommand::Write(chunk.clone()));
                }
                if release.finished {
                    debug!(tunnel = self.id, "peer close released; draining sink");
                    let _ = self.sink_tx.send(SinkCommand::Finish);
                }
            }
            Ok(Offer::Duplicate) | Ok(Offer::AfterClose) => {
                Counters::bump(&self.counters.duplicates);
            }
            Ok(Offer::Buffered) => {}
            Err(_) => Counters::bump(&self.counters.rejected),
        }

        let pending = reorder.pending_frames();
        let ack = reorder.next_expected();
        drop(reorder);

        if pending > self.resend_threshold {
            self.request_resend(ack);
        }
        result
    }

    fn request_resend(&self, ack: u64) {
        if self.last_resend_ack.swap(ack, Ordering::Relaxed) == ack {
            return;
        }
        debug!(tunnel = self.id, ack, "requesting resend");
        let request = Outbound {
            peer_session_id: Arc::clone(&self.peer_session_id),
            message: Message::Resend {
                tunnel_id: self.id,
                ack,
            },
        };
        if self.outbound.try_send(request).is_err() {
            debug!(tunnel = self.id, ack, "resend request dropped: outbound queue unavailable");
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Make the tunnel terminal. Idempotent; returns `true` only for the call
    /// that actually closed it.
    ///
    /// Sources and the sink are released by the tasks that own them: an
    /// in-flight sink write is allowed to finish, no new one is started.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        info!(tunnel = self.id, session = %self.peer_session_id, %reason, "tunnel closed");
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Resolves as soon as the tunnel becomes terminal.
    pub async fn terminated(&self) {
        self.cancel.cancelled().await
    }

    /// Resolves once the tunnel is terminal and every source and the sink
    /// have been released.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
        self.tasks.wait().await;
    }

    // ── Observability ────────────────────────────────────────────

    pub fn stats(&self) -> TunnelStats {
        let phase = TunnelPhase::of(self.is_closed(), self.tasks.is_empty());
        self.counters
            .snapshot(self.id, &self.peer_session_id, phase)
    }

    fn lock_reorder(&self) -> MutexGuard<'_, ReorderBuffer> {
        self.reorder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("peer_session_id", &self.peer_session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
