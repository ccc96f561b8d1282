//! Boundary between the transport and the tunnels.
//!
//! Inbound frames are routed by tunnel id through the [`Registry`]; frames
//! the tunnels produce come out of the single outbound channel returned by
//! [`Dispatcher::new`]. Delivery never blocks: a backpressured tunnel rejects
//! frames instead of stalling the others.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::frame::{Frame, Outbound};
use crate::registry::Registry;
use crate::reorder::Offer;
use crate::tunnel::{Sink, Source, Tunnel, TunnelHandle, TunnelStats};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Released to the sink, together with any frames it unblocked.
    Applied { released: usize },
    /// Held until the gap in front of it closes.
    Buffered,
    /// Already released or already held; dropped.
    Duplicate,
    /// Over capacity (gap buffer or sink backlog); the peer must retransmit.
    Rejected,
    /// The tunnel or its inbound direction already ended.
    Closed,
    /// No such tunnel, typically a late frame after teardown.
    UnknownTunnel,
    /// The tunnel belongs to a different peer session.
    NotOwner,
}

pub type OutboundReceiver = mpsc::Receiver<Outbound>;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Registry,
    config: Arc<TunnelConfig>,
    outbound: mpsc::Sender<Outbound>,
}

impl Dispatcher {
    /// Create a dispatcher with its own registry.
    pub fn new(config: TunnelConfig) -> Result<(Self, OutboundReceiver), TunnelError> {
        let registry = Registry::with_retirement(config.session_retirement());
        Self::with_registry(registry, config)
    }

    /// Create a dispatcher over an existing registry.
    pub fn with_registry(
        registry: Registry,
        config: TunnelConfig,
    ) -> Result<(Self, OutboundReceiver), TunnelError> {
        config.validate()?;
        let (outbound, rx) = mpsc::channel(config.outbound_queue);
        let dispatcher = Self {
            registry,
            config: Arc::new(config),
            outbound,
        };
        Ok((dispatcher, rx))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ── Control plane ────────────────────────────────────────────

    /// Register a tunnel and start pumping it.
    ///
    /// `sources` are fanned into one outbound sequence; there is no ordering
    /// promise between distinct sources beyond the order their bytes happen
    /// to be read. On error the sink and sources are dropped.
    pub fn create_tunnel(
        &self,
        id: u64,
        peer_session_id: &str,
        sink: Sink,
        sources: Vec<Source>,
    ) -> Result<TunnelHandle, TunnelError> {
        if sources.is_empty() {
            return Err(TunnelError::NoSources);
        }
        let session: Arc<str> = Arc::from(peer_session_id);
        let config = Arc::clone(&self.config);
        let outbound = self.outbound.clone();
        self.registry.create(id, peer_session_id, move || {
            Tunnel::spawn(id, session, sink, sources, &config, outbound)
        })
    }

    /// Remove and close one tunnel. Returns `false` if it was not registered.
    pub fn close_tunnel(&self, id: u64) -> bool {
        self.registry.remove(id)
    }

    /// Close every tunnel of a terminated session. Returns how many closed.
    pub fn close_all_for_session(&self, peer_session_id: &str) -> usize {
        self.registry.remove_all_for_session(peer_session_id)
    }

    /// Allow a torn-down session to own tunnels again before its retirement
    /// lapses.
    pub fn release_session(&self, peer_session_id: &str) -> bool {
        self.registry.release_session(peer_session_id)
    }

    // ── Transport ────────────────────────────────────────────────

    /// Route one inbound frame to its tunnel.
    pub fn deliver(&self, frame: Frame) -> Delivery {
        let Some(tunnel) = self.registry.get(frame.tunnel_id) else {
            debug!(tunnel = frame.tunnel_id, seq = frame.sequence, "frame for unknown tunnel dropped");
            return Delivery::UnknownTunnel;
        };
        Self::offer(&tunnel, frame)
    }

    /// Route one inbound frame that arrived from `peer_session_id`, dropping
    /// it if the tunnel belongs to another session.
    pub fn deliver_from(&self, peer_session_id: &str, frame: Frame) -> Delivery {
        let Some(tunnel) = self.registry.get(frame.tunnel_id) else {
            debug!(tunnel = frame.tunnel_id, seq = frame.sequence, "frame for unknown tunnel dropped");
            return Delivery::UnknownTunnel;
        };
        if tunnel.peer_session_id() != peer_session_id {
            warn!(
                tunnel = frame.tunnel_id,
                session = peer_session_id,
                owner = tunnel.peer_session_id(),
                "session sent data on a tunnel it does not own"
            );
            return Delivery::NotOwner;
        }
        Self::offer(&tunnel, frame)
    }

    fn offer(tunnel: &Tunnel, frame: Frame) -> Delivery {
        let (id, seq) = (frame.tunnel_id, frame.sequence);
        match tunnel.offer(frame) {
            Ok(Offer::Released(release)) => Delivery::Applied {
                released: release.byte_len(),
            },
            Ok(Offer::Buffered) => {
                trace!(tunnel = id, seq, "frame buffered behind a gap");
                Delivery::Buffered
            }
            Ok(Offer::Duplicate) => {
                trace!(tunnel = id, seq, "duplicate frame dropped");
                Delivery::Duplicate
            }
            Ok(Offer::AfterClose) => {
                trace!(tunnel = id, seq, "frame after close dropped");
                Delivery::Closed
            }
            Err(e) => {
                debug!(tunnel = id, seq, error = %e, "frame rejected");
                Delivery::Rejected
            }
        }
    }

    // ── Observability ────────────────────────────────────────────

    pub fn stats(&self, id: u64) -> Option<TunnelStats> {
        self.registry.get(id).map(|t| t.stats())
    }

    pub fn all_stats(&self) -> Vec<TunnelStats> {
        self.registry.tunnels().iter().map(|t| t.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::frame::Message;
    use crate::tunnel::CloseReason;

    const WAIT: Duration = Duration::from_secs(5);

    struct Peer {
        /// Reads what the tunnel wrote to its sink.
        sink_peer: DuplexStream,
        /// Writes what the tunnel should read from its source.
        source_peer: DuplexStream,
    }

    fn open(dispatcher: &Dispatcher, id: u64, session: &str) -> (TunnelHandle, Peer) {
        let (sink, sink_peer) = tokio::io::duplex(4096);
        let (source, source_peer) = tokio::io::duplex(4096);
        let handle = dispatcher
            .create_tunnel(id, session, Box::new(sink), vec![Box::new(source)])
            .unwrap();
        (handle, Peer { sink_peer, source_peer })
    }

    #[tokio::test]
    async fn deliver_reports_each_outcome() {
        let config = TunnelConfig {
            capacity_bytes: 4,
            ..Default::default()
        };
        let (dispatcher, _rx) = Dispatcher::new(config).unwrap();
        let (_t, mut peer) = open(&dispatcher, 7, "s1");

        assert_eq!(dispatcher.deliver(Frame::data(7, 2, "cc")), Delivery::Buffered);
        assert_eq!(dispatcher.deliver(Frame::data(7, 0, "aa")), Delivery::Applied { released: 2 });
        assert_eq!(dispatcher.deliver(Frame::data(7, 0, "aa")), Delivery::Duplicate);
        assert_eq!(dispatcher.deliver(Frame::data(7, 3, "dddd")), Delivery::Rejected);
        assert_eq!(dispatcher.deliver(Frame::data(7, 1, "bb")), Delivery::Applied { released: 4 });
        assert_eq!(dispatcher.deliver(Frame::data(99, 0, "?")), Delivery::UnknownTunnel);

        let mut out = [0u8; 6];
        tokio::time::timeout(WAIT, peer.sink_peer.read_exact(&mut out))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(&out, b"aabbcc");

        let stats = dispatcher.stats(7).unwrap();
        assert_eq!(stats.next_expected, 3);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn foreign_session_cannot_inject() {
        let (dispatcher, _rx) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let (_t, _peer) = open(&dispatcher, 1, "owner");

        assert_eq!(dispatcher.deliver_from("intruder", Frame::data(1, 0, "x")), Delivery::NotOwner);
        assert_eq!(dispatcher.stats(1).unwrap().next_expected, 0);
        assert_eq!(
            dispatcher.deliver_from("owner", Frame::data(1, 0, "x")),
            Delivery::Applied { released: 1 }
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_an_error() {
        let (dispatcher, _rx) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let (first, _peer) = open(&dispatcher, 5, "s1");

        let (sink, _a) = tokio::io::duplex(16);
        let (source, _b) = tokio::io::duplex(16);
        let err = dispatcher
            .create_tunnel(5, "s1", Box::new(sink), vec![Box::new(source)])
            .unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateId(5)));
        assert!(!first.is_closed());
        assert_eq!(dispatcher.deliver(Frame::data(5, 0, "ok")), Delivery::Applied { released: 2 });
    }

    #[tokio::test]
    async fn tunnel_without_sources_is_refused() {
        let (dispatcher, _rx) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let (sink, _a) = tokio::io::duplex(16);
        let err = dispatcher.create_tunnel(1, "s1", Box::new(sink), Vec::new()).unwrap_err();
        assert!(matches!(err, TunnelError::NoSources));
        assert!(dispatcher.registry().is_empty());
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let config = TunnelConfig {
            outbound_queue: 0,
            ..Default::default()
        };
        assert!(matches!(Dispatcher::new(config), Err(TunnelError::Config(_))));
    }

    #[tokio::test]
    async fn outbound_frames_carry_the_session() {
        let (dispatcher, mut rx) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let (_t, mut peer) = open(&dispatcher, 3, "s9");

        peer.source_peer.write_all(b"ping").await.unwrap();
        let out = tokio::time::timeout(WAIT, rx.recv()).await.expect("timeout").unwrap();
        assert_eq!(&*out.peer_session_id, "s9");
        assert_eq!(out.message, Message::Data(Frame::data(3, 0, "ping")));
    }

    #[tokio::test]
    async fn session_teardown_closes_and_late_frames_are_dropped() {
        let (dispatcher, _rx) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let (a, _pa) = open(&dispatcher, 1, "gone");
        let (b, _pb) = open(&dispatcher, 2, "stays");

        assert_eq!(dispatcher.close_all_for_session("gone"), 1);
        tokio::time::timeout(WAIT, a.closed()).await.expect("timeout");
        assert_eq!(a.close_reason(), Some(CloseReason::SessionEnded));
        assert!(!b.is_closed());

        assert_eq!(dispatcher.deliver(Frame::data(1, 0, "late")), Delivery::UnknownTunnel);
        assert!(dispatcher.close_tunnel(2));
        assert!(!dispatcher.close_tunnel(2));
        assert_eq!(b.close_reason(), Some(CloseReason::Local));
    }

    #[tokio::test]
    async fn session_retirement_follows_the_config() {
        let config = TunnelConfig {
            session_retire_ms: 20,
            ..Default::default()
        };
        let (dispatcher, _rx) = Dispatcher::new(config).unwrap();
        dispatcher.close_all_for_session("gone");
        assert_eq!(dispatcher.registry().retired_sessions(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dispatcher.registry().retired_sessions(), 0);
        let (t, _p) = open(&dispatcher, 1, "gone");
        assert!(!t.is_closed());

        dispatcher.close_all_for_session("again");
        assert!(dispatcher.release_session("again"));
        let (t, _p) = open(&dispatcher, 2, "again");
        assert!(!t.is_closed());
    }

    #[tokio::test]
    async fn one_stuck_tunnel_does_not_block_another() {
        let config = TunnelConfig {
            capacity_bytes: 8,
            ..Default::default()
        };
        let (dispatcher, _rx) = Dispatcher::new(config).unwrap();
        // Tiny duplex buffer and nobody reading: tunnel 1's sink stalls.
        let (sink, _stalled_reader) = tokio::io::duplex(1);
        let (source, _s) = tokio::io::duplex(16);
        dispatcher
            .create_tunnel(1, "s", Box::new(sink), vec![Box::new(source)])
            .unwrap();
        let (_t2, mut peer2) = open(&dispatcher, 2, "s");

        let mut seq = 0;
        while dispatcher.deliver(Frame::data(1, seq, "0123456789")) != Delivery::Rejected {
            seq += 1;
            assert!(seq < 100, "backlog never filled");
        }

        assert_eq!(dispatcher.deliver(Frame::data(2, 0, "free")), Delivery::Applied { released: 4 });
        let mut out = [0u8; 4];
        tokio::time::timeout(WAIT, peer2.sink_peer.read_exact(&mut out))
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(&out, b"free");
    }

    #[tokio::test]
    async fn all_stats_lists_every_tunnel() {
        let (dispatcher, _rx) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let (_a, _pa) = open(&dispatcher, 1, "s");
        let (_b, _pb) = open(&dispatcher, 2, "s");
        let mut ids: Vec<u64> = dispatcher.all_stats().iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
