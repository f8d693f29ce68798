// Handoff Linux: direct file transfer with one peer over TCP, driven from stdin.

mod commands;
mod config;
mod downloads;
mod runner;
mod transport;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Send files directly to one peer.
#[derive(Parser, Debug)]
#[command(name = "handoff-linux", version, about)]
struct Cli {
    /// Name announced to the peer.
    #[arg(long, global = true)]
    name: Option<String>,

    /// Directory received files are written to.
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    /// Accept every incoming offer without asking.
    #[arg(long, global = true)]
    auto_accept: bool,

    /// Offer this file as soon as the peer is connected. Repeatable.
    #[arg(long = "send", value_name = "FILE", global = true)]
    send: Vec<PathBuf>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Wait for one peer to connect.
    Listen {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Dial a listening peer.
    Connect {
        /// host:port of the listening peer.
        addr: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load()?;
    if let Some(name) = cli.name {
        cfg.name = name;
    }
    if let Some(dir) = cli.download_dir {
        cfg.download_dir = dir;
    }
    if cli.auto_accept {
        cfg.auto_accept = true;
    }
    if let Mode::Listen { port: Some(p) } = cli.mode {
        cfg.port = p;
    }
    info!(name = %cfg.name, download_dir = %cfg.download_dir.display(), "starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.mode, cfg, cli.send))
}

async fn run(mode: Mode, cfg: config::Config, send: Vec<PathBuf>) -> anyhow::Result<()> {
    let runner = runner::Runner::new(&cfg)?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let stream = tokio::select! {
        stream = establish(&mode, cfg.port) => stream?,
        signal = &mut shutdown => {
            signal?;
            info!("shutdown before a peer connected");
            return Ok(());
        }
    };

    runner
        .run(stream, send, async move {
            if let Err(e) = shutdown.await {
                warn!(error = %e, "signal handling unavailable");
                std::future::pending::<()>().await;
            }
        })
        .await
}

async fn establish(mode: &Mode, port: u16) -> anyhow::Result<TcpStream> {
    let mut stream = match mode {
        Mode::Listen { .. } => {
            let listener = transport::bind(port)
                .await
                .with_context(|| format!("binding port {}", port))?;
            transport::accept_one(&listener)
                .await
                .context("accepting peer")?
        }
        Mode::Connect { addr } => transport::connect(addr)
            .await
            .with_context(|| format!("connecting to {}", addr))?,
    };
    transport::handshake(&mut stream)
        .await
        .context("protocol handshake")?;
    Ok(stream)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
