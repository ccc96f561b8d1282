//! tunmux relay: entry point.
//!
//! ```text
//! tunmux-relay --listen 0.0.0.0:7400              Accept a peer, relay stdio
//! tunmux-relay --connect host:7400 --exec sh -i   Dial a peer, relay a child process
//! tunmux-relay --config <path>                    Load a custom config TOML
//! tunmux-relay --gen-config [path]                Write default config to stdout or a file
//! ```
//!
//! Logs go to stderr; stdout belongs to the tunnel.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunmux_relay::config::{LinkMode, RelayConfig};
use tunmux_relay::relay::{self, Endpoint};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tunmux-relay", about = "Carry one multiplexed tunnel over a TCP peer link")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tunmux-relay.toml")]
    config: PathBuf,

    /// Write the default configuration to PATH (or stdout) and exit.
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    gen_config: Option<Option<PathBuf>>,

    /// Accept one peer on this address.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Dial the peer at this address.
    #[arg(long)]
    connect: Option<String>,

    /// Tunnel id; both sides must use the same one.
    #[arg(long)]
    tunnel: Option<u64>,

    /// Name for the peer session.
    #[arg(long)]
    session: Option<String>,

    /// Relay a child process instead of stdio.
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "CMD")]
    exec: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(address) = &self.listen {
            config.link.mode = LinkMode::Listen;
            config.link.address = address.clone();
        }
        if let Some(address) = &self.connect {
            config.link.mode = LinkMode::Connect;
            config.link.address = address.clone();
        }
        if let Some(id) = self.tunnel {
            config.link.tunnel_id = id;
        }
        if let Some(session) = &self.session {
            config.link.session = session.clone();
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    match &cli.gen_config {
        Some(Some(path)) => {
            RelayConfig::write_default(path)?;
            eprintln!("wrote default config to {}", path.display());
            return Ok(());
        }
        Some(None) => {
            println!("{}", toml::to_string_pretty(&RelayConfig::default())?);
            return Ok(());
        }
        None => {}
    }

    // Load config.
    let mut config = RelayConfig::load(&cli.config);
    cli.apply(&mut config);

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("tunmux-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("mode: {:?} {}", config.link.mode, config.link.address);
    info!("tunnel: {} session: {}", config.link.tunnel_id, config.link.session);

    let endpoint = match cli.exec.split_first() {
        Some((program, args)) => Endpoint::exec(program, args)?,
        None => Endpoint::stdio(),
    };

    let stream = relay::establish(&config.link).await?;
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; closing tunnel");
        } else {
            std::future::pending::<()>().await;
        }
    };

    let outcome = relay::run_tunnel(
        stream,
        &config.tunnel,
        &config.link.session,
        config.link.tunnel_id,
        endpoint,
        shutdown,
    )
    .await;

    // A blocking stdin read would otherwise hold the runtime open.
    match outcome {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "relay failed");
            std::process::exit(1);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
