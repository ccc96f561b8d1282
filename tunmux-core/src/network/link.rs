use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::FrameCodec;
use crate::dispatcher::{Dispatcher, OutboundReceiver};
use crate::frame::Message;

/// One peer session carried over a framed byte stream.
///
/// The writer task drains the dispatcher's outbound channel onto the wire;
/// the reader task hands every inbound frame to
/// [`Dispatcher::deliver_from`]. When the wire ends, every tunnel of the
/// session is closed.
#[derive(Debug)]
pub struct Link {
    session: Arc<str>,
    stop: CancellationToken,
    wire_closed: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    pub fn spawn<S>(
        stream: S,
        dispatcher: Dispatcher,
        session: impl Into<Arc<str>>,
        mut outbound: OutboundReceiver,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session: Arc<str> = session.into();
        let (mut net_writer, mut net_reader) = Framed::new(stream, FrameCodec).split();
        let stop = CancellationToken::new();
        let wire_closed = CancellationToken::new();

        // Writer task: tunnels -> network
        let writer = {
            let session = Arc::clone(&session);
            let dispatcher = dispatcher.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    // Queued frames are still flushed after a stop request.
                    let next = tokio::select! {
                        biased;
                        item = outbound.recv() => item,
                        _ = stop.cancelled() => outbound.try_recv().ok(),
                    };
                    let Some(item) = next else {
                        break;
                    };
                    if item.peer_session_id != session {
                        debug!(
                            session = %session,
                            target = %item.peer_session_id,
                            "outbound message for another session dropped"
                        );
                        continue;
                    }
                    if let Err(e) = net_writer.send(item.message).await {
                        warn!(session = %session, error = %e, "link write failed");
                        dispatcher.close_all_for_session(&session);
                        break;
                    }
                }
                if let Err(e) = net_writer.close().await {
                    debug!(session = %session, error = %e, "link close failed");
                }
            })
        };

        // Reader task: network -> tunnels
        let reader = {
            let session = Arc::clone(&session);
            let wire_closed = wire_closed.clone();
            tokio::spawn(async move {
                while let Some(result) = net_reader.next().await {
                    match result {
                        Ok(Message::Data(frame)) => {
                            dispatcher.deliver_from(&session, frame);
                        }
                        Ok(Message::Resend { tunnel_id, ack }) => {
                            // Retransmission belongs to the transport; a plain
                            // stream link never loses frames.
                            debug!(session = %session, tunnel = tunnel_id, ack, "peer requested resend");
                        }
                        Err(e) => {
                            warn!(session = %session, error = %e, "link read failed");
                            break;
                        }
                    }
                }
                let swept = dispatcher.close_all_for_session(&session);
                info!(session = %session, tunnels = swept, "link closed");
                wire_closed.cancel();
            })
        };

        Self {
            session,
            stop,
            wire_closed,
            reader,
            writer,
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn is_wire_closed(&self) -> bool {
        self.wire_closed.is_cancelled()
    }

    /// Resolves once the peer's side of the wire has ended and the session's
    /// tunnels have been closed.
    pub async fn join(&self) {
        self.wire_closed.cancelled().await
    }

    /// Flush what is already queued for the wire, then stop both tasks.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.writer.await {
            debug!(session = %self.session, error = %e, "link writer ended abnormally");
        }
        self.reader.abort();
    }
}
