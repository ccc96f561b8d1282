//! Integration tests: two dispatchers joined by a real TCP link on
//! localhost, exercising data flow, close propagation and session teardown.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

use tunmux_core::{
    CloseReason, Dispatcher, Link, TunnelConfig, TunnelError, TunnelHandle, TunnelPhase,
};

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ──────────────────────────────────────────────────────

struct Side {
    dispatcher: Dispatcher,
    link: Link,
}

/// Two sides of one peer session. Each side names the other.
async fn linked_pair() -> (Side, Side) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (accepted, connected) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (server_stream, _) = accepted.unwrap();
    let client_stream = connected.unwrap();

    let side = |stream: TcpStream, peer: &str| {
        let (dispatcher, outbound) = Dispatcher::new(TunnelConfig::default()).unwrap();
        let link = Link::spawn(stream, dispatcher.clone(), peer, outbound);
        Side { dispatcher, link }
    };
    (side(server_stream, "peer-b"), side(client_stream, "peer-a"))
}

/// Local ends of one tunnel, as an application would hold them.
struct Ends {
    tunnel: TunnelHandle,
    /// Bytes written here come out of the remote sink.
    input: DuplexStream,
    /// Bytes released by this tunnel's sink arrive here.
    output: DuplexStream,
}

fn open(side: &Side, id: u64) -> Ends {
    let (sink, output) = tokio::io::duplex(64 * 1024);
    let (source, input) = tokio::io::duplex(64 * 1024);
    let tunnel = side
        .dispatcher
        .create_tunnel(id, side.link.session(), Box::new(sink), vec![Box::new(source)])
        .unwrap();
    Ends {
        tunnel,
        input,
        output,
    }
}

async fn read_n(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading")
        .unwrap();
    buf
}

async fn read_to_eof(stream: &mut DuplexStream) -> Vec<u8> {
    let mut buf = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut buf))
        .await
        .expect("timed out waiting for end of stream")
        .unwrap();
    buf
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

// ── Data flow ────────────────────────────────────────────────────

#[tokio::test]
async fn test_bytes_cross_in_both_directions() {
    let (a, b) = linked_pair().await;
    let mut at_a = open(&a, 1);
    let mut at_b = open(&b, 1);

    at_a.input.write_all(b"hello from a").await.unwrap();
    assert_eq!(read_n(&mut at_b.output, 12).await, b"hello from a");

    at_b.input.write_all(b"hello from b").await.unwrap();
    assert_eq!(read_n(&mut at_a.output, 12).await, b"hello from b");

    let stats = a.dispatcher.stats(1).unwrap();
    assert_eq!(stats.bytes_out, 12);
    assert_eq!(stats.bytes_in, 12);
    assert_eq!(stats.phase, TunnelPhase::Open);
}

#[tokio::test]
async fn test_large_stream_is_chunked_and_reassembled() {
    let (a, b) = linked_pair().await;
    let at_a = open(&a, 2);
    let mut at_b = open(&b, 2);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let mut input = at_a.input;
    let writer = tokio::spawn(async move {
        input.write_all(&payload).await.unwrap();
        input.shutdown().await.unwrap();
    });

    let received = read_to_eof(&mut at_b.output).await;
    writer.await.unwrap();
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);

    // Tunnel 2 ended with its source; read the handle, not the registry.
    let stats = at_a.tunnel.stats();
    assert_eq!(stats.bytes_out, expected.len() as u64);
    let chunk = TunnelConfig::default().chunk_size as u64;
    assert!(stats.write_sequence > expected.len() as u64 / chunk);
}

#[tokio::test]
async fn test_tunnels_are_independent() {
    let (a, b) = linked_pair().await;
    let mut ends_a: Vec<Ends> = (10..13).map(|id| open(&a, id)).collect();
    let mut ends_b: Vec<Ends> = (10..13).map(|id| open(&b, id)).collect();

    for (i, ends) in ends_a.iter_mut().enumerate() {
        ends.input.write_all(format!("tunnel-{i}").as_bytes()).await.unwrap();
    }
    for (i, ends) in ends_b.iter_mut().enumerate() {
        let got = read_n(&mut ends.output, 8).await;
        assert_eq!(got, format!("tunnel-{i}").as_bytes());
    }
}

// ── Close ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_source_eof_tears_down_both_sides() {
    let (a, b) = linked_pair().await;
    let mut at_a = open(&a, 3);
    let mut at_b = open(&b, 3);

    at_b.input.write_all(b"response").await.unwrap();
    assert_eq!(read_n(&mut at_a.output, 8).await, b"response");

    at_a.input.write_all(b"request").await.unwrap();
    at_a.input.shutdown().await.unwrap();
    assert_eq!(read_to_eof(&mut at_b.output).await, b"request");

    tokio::time::timeout(WAIT, at_a.tunnel.closed()).await.expect("a never closed");
    tokio::time::timeout(WAIT, at_b.tunnel.closed()).await.expect("b never closed");
    assert_eq!(at_a.tunnel.close_reason(), Some(CloseReason::SourcesEnded));
    assert_eq!(at_b.tunnel.close_reason(), Some(CloseReason::PeerClosed));

    // b's source was released with its tunnel.
    assert!(at_b.input.write_all(b"too late").await.is_err());
    assert!(read_to_eof(&mut at_a.output).await.is_empty());

    wait_for(|| a.dispatcher.registry().is_empty() && b.dispatcher.registry().is_empty()).await;
}

#[tokio::test]
async fn test_local_close_ends_the_remote_sink() {
    let (a, b) = linked_pair().await;
    let at_a = open(&a, 4);
    let mut at_b = open(&b, 4);

    assert!(a.dispatcher.close_tunnel(4));
    assert_eq!(at_a.tunnel.close_reason(), Some(CloseReason::Local));

    // The remote side sees a clean end of stream and tears down too.
    assert!(read_to_eof(&mut at_b.output).await.is_empty());
    tokio::time::timeout(WAIT, at_b.tunnel.closed()).await.expect("b never closed");
    assert_eq!(at_b.tunnel.close_reason(), Some(CloseReason::PeerClosed));
    assert_eq!(at_b.tunnel.stats().phase, TunnelPhase::Closed);
    wait_for(|| b.dispatcher.registry().is_empty()).await;
}

#[tokio::test]
async fn test_wire_loss_closes_the_session() {
    let (a, b) = linked_pair().await;
    let at_a = open(&a, 5);
    let _at_b = open(&b, 5);

    b.link.shutdown().await;

    tokio::time::timeout(WAIT, a.link.join()).await.expect("link never closed");
    assert!(a.link.is_wire_closed());
    assert_eq!(at_a.tunnel.close_reason(), Some(CloseReason::SessionEnded));
    assert!(a.dispatcher.registry().is_empty());

    // The session is retired: no new tunnel may join it.
    let (sink, _out) = tokio::io::duplex(16);
    let (source, _in) = tokio::io::duplex(16);
    let err = a
        .dispatcher
        .create_tunnel(6, a.link.session(), Box::new(sink), vec![Box::new(source)])
        .unwrap_err();
    assert!(matches!(err, TunnelError::SessionClosed(_)));
}

// ── Registry ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_duplicate_create_keeps_the_live_tunnel_flowing() {
    let (a, b) = linked_pair().await;
    let mut at_a = open(&a, 5);
    let mut at_b = open(&b, 5);

    let (sink, _out) = tokio::io::duplex(16);
    let (source, _in) = tokio::io::duplex(16);
    let err = a
        .dispatcher
        .create_tunnel(5, a.link.session(), Box::new(sink), vec![Box::new(source)])
        .unwrap_err();
    assert!(matches!(err, TunnelError::DuplicateId(5)));

    at_a.input.write_all(b"still here").await.unwrap();
    assert_eq!(read_n(&mut at_b.output, 10).await, b"still here");
    at_b.input.write_all(b"ack").await.unwrap();
    assert_eq!(read_n(&mut at_a.output, 3).await, b"ack");
    assert!(!at_a.tunnel.is_closed());
}

#[tokio::test]
async fn test_frames_for_a_foreign_session_are_dropped() {
    let (a, b) = linked_pair().await;
    let mut at_a = open(&a, 7);

    // Tunnel 7 on b belongs to a different session than the link's.
    let (sink, mut output) = tokio::io::duplex(1024);
    let (source, _input) = tokio::io::duplex(1024);
    let foreign = b
        .dispatcher
        .create_tunnel(7, "someone-else", Box::new(sink), vec![Box::new(source)])
        .unwrap();

    at_a.input.write_all(b"nope").await.unwrap();
    wait_for(|| a.dispatcher.stats(7).unwrap().bytes_out == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(foreign.stats().next_expected, 0);
    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(Duration::from_millis(50), output.read(&mut buf)).await;
    assert!(read.is_err(), "foreign session must not receive data");
}
