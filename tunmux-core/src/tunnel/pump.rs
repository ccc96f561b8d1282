//! The tasks that drive a tunnel. Each one exclusively owns the resource it
//! pumps: the read-pump owns the sources and `write_sequence`, the sink
//! writer owns the sink.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::select_all;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::{CloseReason, Sink, SinkCommand, Source, Tunnel};
use crate::frame::{Frame, Message, Outbound};

// ── Read-pump ────────────────────────────────────────────────────

/// Fan every source into one outbound sequence.
///
/// Sources are polled together; bytes from distinct sources interleave in
/// whatever order they happen to be read, but each source's own order is
/// preserved and the sequence numbers are contiguous from 0.
pub(super) async fn read_pump(tunnel: Arc<Tunnel>, sources: Vec<Source>, chunk_size: usize) {
    let mut merged = select_all(
        sources
            .into_iter()
            .map(|source| ReaderStream::with_capacity(source, chunk_size)),
    );
    let mut sequence = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = tunnel.cancel.cancelled() => break,
            next = merged.next() => next,
        };

        match next {
            Some(Ok(mut chunk)) => {
                // The reader may hand back more than asked for.
                let mut sent = true;
                while !chunk.is_empty() && sent {
                    let piece = chunk.split_to(chunk.len().min(chunk_size));
                    let len = piece.len() as u64;
                    sent = emit(&tunnel, Frame::data(tunnel.id, sequence, piece)).await;
                    if sent {
                        sequence += 1;
                        tunnel
                            .counters
                            .write_sequence
                            .store(sequence, Ordering::Relaxed);
                        tunnel.counters.bytes_out.fetch_add(len, Ordering::Relaxed);
                    }
                }
                if !sent {
                    break;
                }
            }
            Some(Err(e)) => {
                // A failed source is finished; the others keep going.
                warn!(tunnel = tunnel.id, error = %e, "source read failed");
                tunnel.counters.source_errors.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                debug!(tunnel = tunnel.id, seq = sequence, "all sources reached end of stream");
                if !emit(&tunnel, Frame::close(tunnel.id, sequence)).await {
                    break;
                }
                tunnel
                    .counters
                    .write_sequence
                    .store(sequence + 1, Ordering::Relaxed);
                drop(merged);
                // The peer has its close frame; the sink writer finishes any
                // in-flight write and shuts the sink down.
                tunnel.close(CloseReason::SourcesEnded);
                return;
            }
        }
    }

    drop(merged);

    // Closed before our close frame went out.
    if tunnel.close_reason().is_some_and(CloseReason::notifies_peer) {
        let notice = Outbound {
            peer_session_id: Arc::clone(&tunnel.peer_session_id),
            message: Message::Data(Frame::close(tunnel.id, sequence)),
        };
        if tunnel.outbound.try_send(notice).is_err() {
            debug!(tunnel = tunnel.id, "close notice dropped: outbound queue unavailable");
        } else {
            tunnel
                .counters
                .write_sequence
                .store(sequence + 1, Ordering::Relaxed);
        }
    }
}

/// Hand one frame to the transport. Returns `false` if the tunnel was closed
/// first or the transport is gone.
async fn emit(tunnel: &Tunnel, frame: Frame) -> bool {
    let outbound = Outbound {
        peer_session_id: Arc::clone(&tunnel.peer_session_id),
        message: Message::Data(frame),
    };
    tokio::select! {
        biased;
        _ = tunnel.cancel.cancelled() => false,
        sent = tunnel.outbound.send(outbound) => match sent {
            Ok(()) => true,
            Err(_) => {
                tunnel.close(CloseReason::TransportGone);
                false
            }
        },
    }
}

// ── Sink writer ──────────────────────────────────────────────────

/// Write released bytes to the sink in release order, then shut it down
/// exactly once. Draining the peer's close frame ends the tunnel.
pub(super) async fn sink_writer(
    tunnel: Arc<Tunnel>,
    mut sink: Sink,
    mut commands: mpsc::UnboundedReceiver<SinkCommand>,
) {
    let finished = loop {
        let command = tokio::select! {
            biased;
            _ = tunnel.cancel.cancelled() => break false,
            command = commands.recv() => command,
        };

        match command {
            Some(SinkCommand::Write(chunk)) => {
                let len = chunk.len();
                let written = match sink.write_all(&chunk).await {
                    Ok(()) => sink.flush().await,
                    Err(e) => Err(e),
                };
                tunnel.counters.sink_backlog.fetch_sub(len, Ordering::Relaxed);
                if let Err(e) = written {
                    warn!(tunnel = tunnel.id, error = %e, "sink write failed");
                    tunnel.close(CloseReason::SinkFailed);
                    break false;
                }
            }
            Some(SinkCommand::Finish) => break true,
            None => break false,
        }
    };

    if let Err(e) = sink.shutdown().await {
        debug!(tunnel = tunnel.id, error = %e, "sink shutdown failed");
    }
    drop(sink);

    if finished {
        tunnel.close(CloseReason::PeerClosed);
    }
}

// ── Gap watchdog ─────────────────────────────────────────────────

/// Close the tunnel when the reorder buffer holds a gap that has not made
/// progress for `timeout`.
pub(super) async fn gap_watchdog(tunnel: Arc<Tunnel>, timeout: Duration) {
    let period = (timeout / 4).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = tunnel.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let (age, finished) = {
            let reorder = tunnel.lock_reorder();
            (reorder.gap_age(Instant::now()), reorder.is_finished())
        };
        if finished {
            return;
        }
        if let Some(age) = age.filter(|age| *age >= timeout) {
            warn!(
                tunnel = tunnel.id,
                gap_ms = age.as_millis() as u64,
                "sequence gap never closed"
            );
            tunnel.close(CloseReason::GapTimeout);
            return;
        }
    }
}
