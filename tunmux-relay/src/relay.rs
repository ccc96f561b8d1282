//! Wires one tunnel between a local endpoint and a TCP peer link.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use tunmux_core::{CloseReason, Dispatcher, Link, Sink, Source, TunnelConfig, TunnelError};

use crate::config::{LinkConfig, LinkMode};

/// Open the peer link described by `link`.
pub async fn establish(link: &LinkConfig) -> Result<TcpStream, TunnelError> {
    match link.mode {
        LinkMode::Listen => {
            let listener = TcpListener::bind(&link.address).await?;
            info!(address = %listener.local_addr()?, "waiting for peer");
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "peer connected");
            Ok(stream)
        }
        LinkMode::Connect => {
            let timeout = Duration::from_millis(link.connect_timeout_ms);
            let stream = tokio::time::timeout(timeout, TcpStream::connect(&link.address))
                .await
                .map_err(|_| format!("connect to {} timed out", link.address))??;
            info!(peer = %link.address, "connected to peer");
            Ok(stream)
        }
    }
}

/// Local ends of the relayed tunnel.
pub struct Endpoint {
    pub sink: Sink,
    pub sources: Vec<Source>,
    /// Set when the endpoint is a child process.
    pub child: Option<Child>,
}

impl Endpoint {
    /// This process's stdin feeds the tunnel; stdout receives from it.
    pub fn stdio() -> Self {
        Self {
            sink: Box::new(tokio::io::stdout()),
            sources: vec![Box::new(tokio::io::stdin())],
            child: None,
        }
    }

    /// A child process: its stdout and stderr both feed the tunnel, its
    /// stdin receives from it.
    pub fn exec(program: &str, args: &[String]) -> Result<Self, TunnelError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or("child stdin was not captured")?;
        let stdout = child.stdout.take().ok_or("child stdout was not captured")?;
        let stderr = child.stderr.take().ok_or("child stderr was not captured")?;
        info!(program, pid = child.id(), "child started");

        Ok(Self {
            sink: Box::new(stdin),
            sources: vec![Box::new(stdout), Box::new(stderr)],
            child: Some(child),
        })
    }
}

/// Run tunnel `id` over `stream` until it ends, the link drops, or
/// `shutdown` resolves. Returns why the tunnel closed.
///
/// The tunnel is registered before the link starts reading, so no early
/// frame from the peer finds it missing.
pub async fn run_tunnel<S, F>(
    stream: S,
    config: &TunnelConfig,
    session: &str,
    id: u64,
    endpoint: Endpoint,
    shutdown: F,
) -> Result<Option<CloseReason>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    F: Future<Output = ()>,
{
    let Endpoint {
        sink,
        sources,
        child,
    } = endpoint;

    let (dispatcher, outbound) = Dispatcher::new(config.clone())?;
    let tunnel = dispatcher.create_tunnel(id, session, sink, sources)?;
    let link = Link::spawn(stream, dispatcher.clone(), session, outbound);

    tokio::pin!(shutdown);
    tokio::select! {
        _ = tunnel.closed() => {}
        _ = link.join() => warn!(tunnel = id, "peer link ended"),
        _ = &mut shutdown => {
            info!(tunnel = id, "shutdown requested");
            dispatcher.close_tunnel(id);
        }
    }

    tunnel.closed().await;
    link.shutdown().await;
    if let Some(child) = child {
        reap(child).await;
    }

    let stats = tunnel.stats();
    info!(
        tunnel = id,
        bytes_in = stats.bytes_in,
        bytes_out = stats.bytes_out,
        reason = ?tunnel.close_reason(),
        "relay finished"
    );
    Ok(tunnel.close_reason())
}

async fn reap(mut child: Child) {
    match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
        Ok(Ok(status)) => info!(%status, "child exited"),
        Ok(Err(e)) => warn!(error = %e, "waiting for child failed"),
        Err(_) => {
            warn!("child still running; killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "kill failed");
            }
        }
    }
}
